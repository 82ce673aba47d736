mod common;

use common::{harness, harness_with, payload, MB};
use replhub_core::ledger::JobLedger;
use replhub_core::model::JobStatus;
use replhub_core::queue::WorkQueue;
use replhub_pipeline::PipelineState;

#[tokio::test(start_paused = true)]
async fn test_three_new_objects_replicated() {
    let h = harness().await;
    h.src.insert("data/a.txt", "alpha");
    h.src.insert("data/b.txt", "bravo");
    h.src.insert("data/c/d.txt", "charlie");
    h.src.insert("other/e.txt", "outside the prefix");

    let report = h.find().await;
    assert_eq!(report.enqueued, 3);
    assert_eq!(h.ledger.status_counts().pending, 3);
    assert_eq!(h.queue.depth().await.unwrap().visible, 3);

    let drained = h.pipeline.drain().await.unwrap();
    assert_eq!(drained.transferred, 3);
    assert_eq!(drained.dead_letters, 0);

    let counts = h.ledger.status_counts();
    assert_eq!(counts.done, 3);
    assert_eq!(counts.pending + counts.in_progress + counts.failed, 0);
    assert!(h.queue.depth().await.unwrap().is_empty());
    assert!(h.queue.dead_letters().await.unwrap().is_empty());
    assert_eq!(h.pipeline.metrics().transferred_objects, 3);
    assert_eq!(h.pipeline.state().await, PipelineState::Stopped);

    assert_eq!(h.dst.object("data/c/d.txt").unwrap().data, "charlie");
    assert!(h.dst.object("other/e.txt").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_second_finder_run_is_noop() {
    let h = harness().await;
    h.src.insert("data/a", "1");
    h.src.insert("data/b", "2");
    h.find().await;
    h.pipeline.drain().await.unwrap();

    let again = h.find().await;
    assert_eq!(again.enqueued, 0);
    assert_eq!(again.skipped_unchanged, 2);
    assert!(h.queue.depth().await.unwrap().is_empty());
    assert_eq!(h.ledger.status_counts().done, 2);
}

#[tokio::test(start_paused = true)]
async fn test_changed_object_replicated_again() {
    let h = harness().await;
    h.src.insert("data/a", "first");
    h.find().await;
    h.pipeline.drain().await.unwrap();

    h.src.insert("data/a", "second, longer");
    assert_eq!(h.find().await.enqueued, 1);
    h.pipeline.drain().await.unwrap();

    assert_eq!(h.dst.object("data/a").unwrap().data, "second, longer");
    let row = h.ledger.get("src/data/a").await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Done);
    assert_eq!(row.try_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_large_object_copied_in_parts() {
    let h = harness().await;
    let big = payload(3 * MB + 17);
    h.src.insert("data/big.bin", big.clone());
    h.find().await;

    let drained = h.pipeline.drain().await.unwrap();
    assert_eq!(drained.bytes, big.len() as u64);
    let written = h.dst.object("data/big.bin").unwrap();
    assert_eq!(written.data.as_ref(), big.as_slice());
    assert!(written.etag.ends_with("-4\""));
    assert_eq!(h.dst.incomplete_uploads(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_storage_class_and_prefix_mapping() {
    let h = harness_with(|c| {
        c.destination.prefix = "mirror".into();
        c.destination.storage_class = "STANDARD_IA".into();
    })
    .await;
    h.src.insert("data/x/y.txt", "v");
    h.find().await;
    h.pipeline.drain().await.unwrap();

    let written = h.dst.object("mirror/x/y.txt").unwrap();
    assert_eq!(written.storage_class, "STANDARD_IA");
    let rows = h.ledger.query_by_dest_bucket("dst").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].des_key, "mirror/x/y.txt");
}

#[tokio::test(start_paused = true)]
async fn test_metrics_rendered() {
    let h = harness().await;
    h.src.insert("data/a", "12345");
    h.find().await;
    h.pipeline.drain().await.unwrap();

    let text = h.pipeline.render_metrics();
    assert!(text.contains("replhub_transferred_objects_total{source=\"src\",destination=\"dst\"} 1"));
    assert!(text.contains("replhub_completed_bytes_total{source=\"src\",destination=\"dst\"} 5"));
}
