//! Back pressure computed from live queue depths.

use chrono::Utc;
use pretty_assertions::assert_eq;
use prost::Message as _;

use e2e_tests::{text_message, TestHarness};
use ingest_backpressure::{estimate_try_after, BackPressureKind};
use ingest_consumer::{Headers, Transport};

fn seconds_from_now(at: chrono::DateTime<Utc>) -> i64 {
    (at - Utc::now()).num_milliseconds()
}

#[test]
fn test_try_after_estimates() {
    // 120 / 2 = 60, right at the cap
    let at = seconds_from_now(estimate_try_after(2.0, 120, 60));
    assert!((59_000..=60_000).contains(&at), "got {at} ms");

    let at = seconds_from_now(estimate_try_after(2.0, 10, 60));
    assert!((4_000..=5_000).contains(&at), "got {at} ms");

    // Capped by max_wait
    let at = seconds_from_now(estimate_try_after(2.0, 10_000, 60));
    assert!(at <= 60_000, "got {at} ms");
}

#[tokio::test]
async fn test_ingest_backlog_applies_back_pressure() {
    let harness = TestHarness::with_settings(|s| {
        s.back_pressure.enabled = true;
        s.back_pressure.max_ingest_pending = 2;
        s.back_pressure.ingest_rate = 2.0;
    });
    let kbid = harness.create_kb("busy", None).await;
    let materializer = &harness.ctx.materializer;

    // The durable must exist before the transport can count for it
    let processed = harness.processed_consumer();
    let mut subscription = processed.subscribe().await.unwrap();

    let subject = harness.ctx.settings.consumer.processed_subject.clone();
    for i in 0..3 {
        let bm = text_message(&kbid, &format!("r{i}"), "body", "queued");
        harness
            .ctx
            .transport
            .publish(&subject, bm.encode_to_vec(), Headers::new())
            .await
            .unwrap();
    }

    materializer.refresh_ingest().await;
    assert_eq!(materializer.ingest_pending(), 3);

    let first = materializer.maybe_back_pressure(&kbid, None).await.unwrap_err();
    assert_eq!(first.kind, BackPressureKind::Ingest);
    assert!(!first.cached);
    assert!(first.try_after > Utc::now());

    let second = materializer.maybe_back_pressure(&kbid, None).await.unwrap_err();
    assert!(second.cached);
    assert_eq!(second.try_after, first.try_after);
    let stats = materializer.cache_stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));

    // Another resource is a separate cache entry and a fresh decision
    let other = materializer
        .maybe_back_pressure(&kbid, Some("r9"))
        .await
        .unwrap_err();
    assert!(!other.cached);

    // Draining the queue clears the ingest backlog
    harness.drain(&processed, &mut subscription, 3).await;
    materializer.refresh_ingest().await;
    assert_eq!(materializer.ingest_pending(), 0);
    assert!(materializer.check_ingest().is_ok());
}

#[tokio::test]
async fn test_indexing_backlog_reads_in_process_nodes() {
    let harness = TestHarness::with_settings(|s| s.back_pressure.enabled = true);
    let materializer = &harness.ctx.materializer;
    materializer.refresh_indexing().await;
    let pending = materializer.indexing_pending();
    assert_eq!(pending.get("node-0"), Some(&0));
    assert!(materializer.check_indexing().is_ok());
}

#[tokio::test]
async fn test_disabled_back_pressure_never_blocks() {
    let harness = TestHarness::with_settings(|s| {
        s.back_pressure.max_ingest_pending = 0;
    });
    let kbid = harness.create_kb("idle", None).await;
    assert!(!harness.ctx.materializer.enabled());
    assert!(harness
        .ctx
        .materializer
        .maybe_back_pressure(&kbid, None)
        .await
        .is_ok());
}
