//! Export streams through blob storage, files and a second knowledge box.

use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use prost::Message as _;

use e2e_tests::{text_message, TestHarness};
use ingest_daemon::{export_to_file, import_from_file};
use ingest_export::{ExportItem, ExportStreamReader};
use ingest_processor::{knowledgebox, Resource};
use ingest_storage::blob::{kb_bucket, EXPORTS_BUCKET};
use ingest_storage::BlobStorage;
use ingest_types::{CloudFile, FieldFile, Label, LabelSet, Labels, LearningConfiguration};

fn model(name: &str) -> LearningConfiguration {
    LearningConfiguration {
        semantic_model: name.to_string(),
        ..Default::default()
    }
}

/// One 17-byte resource entry, then a binary entry with a 9-byte
/// descriptor and 100 raw bytes.
fn handcrafted_stream() -> Vec<u8> {
    let mut out = Vec::new();
    // field 1 (kbid), 15 bytes
    let resource = [&[0x0a, 15][..], &b"kb-exported-one"[..]].concat();
    assert_eq!(resource.len(), 17);
    out.extend_from_slice(b"RES");
    out.extend_from_slice(&(resource.len() as u32).to_be_bytes());
    out.extend_from_slice(&resource);

    let descriptor = CloudFile {
        uri: "r1/f/ab".to_string(),
        ..Default::default()
    }
    .encode_to_vec();
    assert_eq!(descriptor.len(), 9);
    out.extend_from_slice(b"BIN");
    out.extend_from_slice(&(descriptor.len() as u32).to_be_bytes());
    out.extend_from_slice(&descriptor);
    out.extend_from_slice(&100u32.to_be_bytes());
    out.extend((0..100u8).collect::<Vec<_>>());
    out
}

#[tokio::test]
async fn test_handcrafted_stream_yields_two_items() {
    let harness = TestHarness::new();
    let blob = &harness.ctx.blob;
    blob.upload(EXPORTS_BUCKET, "handcrafted", handcrafted_stream())
        .await
        .unwrap();

    let source = blob.download(EXPORTS_BUCKET, "handcrafted").await.unwrap();
    let mut reader = ExportStreamReader::new(source);
    assert!(reader.maybe_read_learning_config().await.unwrap().is_none());

    match reader.next_item().await.unwrap() {
        Some(ExportItem::Resource(bm)) => assert_eq!(bm.kbid, "kb-exported-one"),
        _ => panic!("expected the resource entry first"),
    }
    match reader.next_item().await.unwrap() {
        Some(ExportItem::Binary(payload)) => {
            assert_eq!(payload.cloud_file.uri, "r1/f/ab");
            let chunks: Vec<Vec<u8>> = payload.into_stream(32).try_collect().await.unwrap();
            let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
            assert_eq!(sizes, vec![32, 32, 32, 4]);
            assert_eq!(chunks.concat(), (0..100u8).collect::<Vec<_>>());
        }
        _ => panic!("expected the binary entry second"),
    }
    assert!(reader.next_item().await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_round_trip_between_knowledge_boxes() {
    let harness = TestHarness::new();
    let src = harness.create_kb("source", Some(&model("en"))).await;

    let data = vec![7u8; 4096];
    let cloud_file = harness
        .ctx
        .blob
        .upload(&kb_bucket(&src), "doc-1/f/report", data.clone())
        .await
        .unwrap();
    let mut bm = text_message(&src, "doc-1", "body", "quarterly report");
    bm.files.insert(
        "report".into(),
        FieldFile {
            file: Some(cloud_file),
            ..Default::default()
        },
    );
    harness.ctx.processor.process_direct(&bm).await.unwrap();

    let mut labels = Labels::default();
    labels.labelset.insert(
        "topics".into(),
        LabelSet {
            title: "Topics".into(),
            labels: vec![Label {
                title: "finance".into(),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    {
        let mut txn = harness.ctx.driver.begin(false).await.unwrap();
        knowledgebox::set_labels(&mut txn, &src, &labels).await.unwrap();
        txn.commit().await.unwrap();
    }

    let path = harness.temp_path().join("source.export");
    let exported = export_to_file(&harness.ctx, &src, &path).await.unwrap();
    assert_eq!(exported.resources, 1);
    assert_eq!(exported.binaries, 1);

    let dst = harness.create_kb("destination", Some(&model("en"))).await;
    let imported = import_from_file(&harness.ctx, &dst, &path).await.unwrap();
    assert_eq!(imported.resources, 1);
    assert_eq!(imported.binaries, 1);
    assert_eq!(imported.labels, 1);

    assert_eq!(
        harness
            .ctx
            .blob
            .download_all(&kb_bucket(&dst), "doc-1/f/report")
            .await
            .unwrap(),
        data
    );
    let mut txn = harness.ctx.driver.begin(true).await.unwrap();
    assert!(Resource::load(&mut txn, &dst, "doc-1").await.unwrap().is_some());
    assert_eq!(
        knowledgebox::get_labels(&mut txn, &dst).await.unwrap(),
        Some(labels)
    );
}

#[tokio::test]
async fn test_incompatible_model_writes_nothing() {
    let harness = TestHarness::new();
    let src = harness.create_kb("english", Some(&model("en"))).await;
    harness
        .ctx
        .processor
        .process_direct(&text_message(&src, "r1", "body", "hello"))
        .await
        .unwrap();
    let path = harness.temp_path().join("english.export");
    export_to_file(&harness.ctx, &src, &path).await.unwrap();

    let dst = harness.create_kb("multilingual", Some(&model("multilingual"))).await;
    let err = import_from_file(&harness.ctx, &dst, &path).await.unwrap_err();
    assert!(format!("{err:#}").contains("Incompatible export"));

    let mut txn = harness.ctx.driver.begin(true).await.unwrap();
    assert!(knowledgebox::list_resources(&mut txn, &dst).await.unwrap().is_empty());
}
