//! Migrations and the task retry budget on a real store.

use pretty_assertions::assert_eq;

use e2e_tests::{text_message, TestHarness};
use ingest_processor::knowledgebox;
use ingest_storage::keys;
use ingest_types::TaskStatus;

#[tokio::test]
async fn test_migrate_all_kbs_and_restore_slugs() {
    let harness = TestHarness::new();
    let first = harness.create_kb("first", None).await;
    let second = harness.create_kb("second", None).await;
    harness
        .ctx
        .processor
        .process_direct(&text_message(&first, "r1", "body", "text"))
        .await
        .unwrap();

    // Lose the slug index entry
    {
        let mut txn = harness.ctx.driver.begin(false).await.unwrap();
        txn.delete(&keys::resource_slug(&first, "r1")).await.unwrap();
        txn.commit().await.unwrap();
    }

    let migrator = harness.ctx.migrator();
    migrator.run(None).await.unwrap();

    let info = migrator.global_info().await.unwrap();
    assert_eq!(info.current_version, migrator.latest_version());
    assert_eq!(info.target_version, None);
    for kbid in [&first, &second] {
        assert_eq!(migrator.kb_version(kbid).await.unwrap(), migrator.latest_version());
    }

    let mut txn = harness.ctx.driver.begin(true).await.unwrap();
    assert_eq!(
        knowledgebox::get_resource_uuid_by_slug(&mut txn, &first, "r1")
            .await
            .unwrap(),
        Some("r1".to_string())
    );
}

#[tokio::test]
async fn test_partial_target_then_latest() {
    let harness = TestHarness::new();
    let kbid = harness.create_kb("stepwise", None).await;
    let migrator = harness.ctx.migrator();

    migrator.run(Some(1)).await.unwrap();
    assert_eq!(migrator.kb_version(&kbid).await.unwrap(), 1);
    assert_eq!(migrator.global_info().await.unwrap().current_version, 1);

    migrator.run(None).await.unwrap();
    assert_eq!(migrator.kb_version(&kbid).await.unwrap(), migrator.latest_version());
}

/// A task that keeps failing is ERRORED by its fifth failure and never
/// attempted a sixth time.
#[tokio::test]
async fn test_export_task_retry_budget() {
    let harness = TestHarness::new();
    let tasks = harness.ctx.export_tasks();
    let task = tasks.start_export("missing-kb").await.unwrap();

    for attempt in 1..=5u32 {
        let current = tasks.data().get_metadata("missing-kb", &task.task_id).await.unwrap();
        assert!(tasks.run_export(current).await.is_err());
        let stored = tasks.data().get_metadata("missing-kb", &task.task_id).await.unwrap();
        assert_eq!(stored.tries, attempt);
        let expected = if attempt < 5 {
            TaskStatus::Failed
        } else {
            TaskStatus::Errored
        };
        assert_eq!(stored.status, expected);
    }

    let current = tasks.data().get_metadata("missing-kb", &task.task_id).await.unwrap();
    assert!(tasks.run_export(current).await.unwrap().is_none());
    let stored = tasks.data().get_metadata("missing-kb", &task.task_id).await.unwrap();
    assert_eq!(stored.tries, 5);
}
