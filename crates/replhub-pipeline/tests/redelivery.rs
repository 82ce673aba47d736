mod common;

use std::time::Duration;

use common::{harness, harness_with, payload, MB};
use replhub_core::config::EventMode;
use replhub_core::ledger::JobLedger;
use replhub_core::model::{JobAction, JobStatus};
use replhub_core::queue::WorkQueue;
use replhub_core::store::StoreOp;
use replhub_pipeline::{JobOutcome, Worker};

mod at_least_once {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_crashed_worker_message_redelivered() {
        let h = harness().await;
        h.src.insert("data/a", "payload");
        h.find().await;

        // A worker takes the message and dies without acknowledging it.
        let leased = h.queue.receive(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased.len(), 1);

        let worker = Worker::new(0, h.ctx());
        assert!(worker.poll_once().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let outcome = worker.poll_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { jobs: 1, .. }));
        assert!(h.queue.depth().await.unwrap().is_empty());
        assert_eq!(h.queue.stats().received, 2);
        assert_eq!(h.ledger.get("src/data/a").await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_message_parked_in_dlq() {
        let h = harness().await;
        h.src.insert("data/good", "ok");
        h.src.insert("data/bad", "forbidden");
        h.src.deny_key("data/bad");
        h.find().await;

        let drained = h.pipeline.drain().await.unwrap();
        assert_eq!(drained.transferred, 1);
        assert_eq!(drained.dead_letters, 1);
        assert_eq!(drained.failed, 3);

        let dead = h.queue.dead_letters().await.unwrap();
        assert_eq!(dead[0].receive_count, 3);
        assert!(dead[0].body.contains("data/bad"));

        let row = h.ledger.get("src/data/bad").await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.try_count, 3);
        assert!(row.error.is_some());
        assert!(h.dst.object("data/bad").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_on_redelivery() {
        let h = harness().await;
        h.src.insert("data/a", "x");
        h.find().await;
        // Two failures outlast the single retry; the redelivery succeeds.
        h.dst.fail_next(StoreOp::Put, 2);

        let drained = h.pipeline.drain().await.unwrap();
        assert_eq!(drained.transferred, 1);
        assert_eq!(drained.failed, 1);
        assert_eq!(drained.dead_letters, 0);
        assert_eq!(h.ledger.get("src/data/a").await.unwrap().unwrap().try_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_dead_lettered() {
        let h = harness().await;
        h.queue.send("not json at all".into()).await.unwrap();
        let drained = h.pipeline.drain().await.unwrap();
        assert_eq!(drained.dead_letters, 1);
        assert_eq!(drained.transferred, 0);
    }
}

mod duplicates {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_duplicate_processing_is_harmless() {
        let h = harness_with(|c| {
            c.finder.skip_compare = true;
            c.finder.require_empty_queue = false;
        })
        .await;
        h.src.insert("data/a", "same bytes");
        h.find().await;
        h.find().await;
        assert_eq!(h.queue.depth().await.unwrap().visible, 2);

        let w1 = Worker::new(1, h.ctx());
        let w2 = Worker::new(2, h.ctx());
        let (a, b) = tokio::join!(w1.poll_once(), w2.poll_once());
        assert!(matches!(a.unwrap(), Some(JobOutcome::Completed { .. })));
        assert!(matches!(b.unwrap(), Some(JobOutcome::Completed { .. })));

        assert_eq!(h.dst.object_count(), 1);
        assert_eq!(h.dst.object("data/a").unwrap().data, "same bytes");
        assert_eq!(h.ledger.len().await.unwrap(), 1);
        let row = h.ledger.get("src/data/a").await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Done);
        assert_eq!(h.pipeline.metrics().transferred_objects, 2);
    }
}

mod multipart {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_failed_parts_leave_no_upload_behind() {
        let h = harness().await;
        h.src.insert("data/big", payload(3 * MB));
        h.dst.fail_always(StoreOp::UploadPart);
        h.find().await;

        let drained = h.pipeline.drain().await.unwrap();
        assert_eq!(drained.dead_letters, 1);
        assert!(h.dst.object("data/big").is_none());
        assert_eq!(h.dst.incomplete_uploads(), 0);
        assert_eq!(h.dst.aborted_uploads().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_parts_abort_at_job_timeout() {
        let h = harness().await;
        h.src.insert("data/big", payload(2 * MB + 1));
        h.dst.set_part_latency(Duration::from_secs(60));
        h.find().await;

        let worker = Worker::new(0, h.ctx());
        let outcome = worker.poll_once().await.unwrap().unwrap();
        match outcome {
            JobOutcome::Failed { error, .. } => assert!(error.contains("timed out"), "{}", error),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert_eq!(h.dst.incomplete_uploads(), 0);
        assert!(h.dst.object("data/big").is_none());
    }
}

mod diff {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_version_change_drives_requeue() {
        let h = harness_with(|c| c.transfer.include_version = true).await;
        let v1 = h.src.insert("data/doc", "v1").unwrap();
        h.find().await;
        h.pipeline.drain().await.unwrap();
        let row = h.ledger.get("src/data/doc").await.unwrap().unwrap();
        assert_eq!(row.version_id.as_deref(), Some(v1.as_str()));

        assert_eq!(h.find().await.enqueued, 0);

        let v2 = h.src.insert("data/doc", "v2").unwrap();
        assert_ne!(v1, v2);
        assert_eq!(h.find().await.enqueued, 1);
        h.pipeline.drain().await.unwrap();
        assert_eq!(h.dst.object("data/doc").unwrap().data, "v2");
        let row = h.ledger.get("src/data/doc").await.unwrap().unwrap();
        assert_eq!(row.version_id.as_deref(), Some(v2.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_retried_by_next_finder_run() {
        let h = harness().await;
        h.src.insert("data/a", "12345");
        h.queue.fail_sends(1);
        assert!(h.pipeline.run_finder(false).await.is_err());
        assert!(h.ledger.get("src/data/a").await.unwrap().is_none());

        assert_eq!(h.find().await.enqueued, 1);
        h.pipeline.drain().await.unwrap();
        assert_eq!(h.dst.object("data/a").unwrap().data, "12345");
        assert_eq!(h.find().await.enqueued, 0);
    }
}

mod events {
    use super::*;

    fn notification(name: &str, key: &str, sequencer: &str) -> String {
        serde_json::json!({"Records": [{
            "eventName": name,
            "s3": {
                "bucket": {"name": "src"},
                "object": {"key": key, "size": 5, "sequencer": sequencer}
            }
        }]})
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_event_replicated_without_finder() {
        let h = harness_with(|c| c.source.event_mode = EventMode::Create).await;
        h.src.insert("data/new file.txt", "hello");

        let trigger = h.pipeline.event_trigger();
        let report = trigger
            .handle_notification(&notification("ObjectCreated:Put", "data/new+file.txt", "0A"))
            .await
            .unwrap();
        assert_eq!(report.enqueued, 1);

        let drained = h.pipeline.drain().await.unwrap();
        assert_eq!(drained.transferred, 1);
        assert_eq!(h.dst.object("data/new file.txt").unwrap().data, "hello");

        // The finder agrees the object is current.
        assert_eq!(h.find().await.skipped_unchanged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_event_removes_destination() {
        let h = harness_with(|c| c.source.event_mode = EventMode::CreateAndDelete).await;
        h.dst.insert("data/old", "stale");

        let trigger = h.pipeline.event_trigger();
        trigger
            .handle_notification(&notification("ObjectRemoved:Delete", "data/old", "0B"))
            .await
            .unwrap();
        h.pipeline.drain().await.unwrap();

        assert!(h.dst.object("data/old").is_none());
        let row = h.ledger.get("src/data/old").await.unwrap().unwrap();
        assert_eq!(row.action, JobAction::Delete);
        assert_eq!(row.status, JobStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finder_restores_object_still_in_source_after_delete() {
        let h = harness_with(|c| c.source.event_mode = EventMode::CreateAndDelete).await;
        h.src.insert("data/a", "12345");
        h.find().await;
        h.pipeline.drain().await.unwrap();
        assert!(h.dst.object("data/a").is_some());

        let trigger = h.pipeline.event_trigger();
        trigger
            .handle_notification(&notification("ObjectRemoved:Delete", "data/a", "0C"))
            .await
            .unwrap();
        h.pipeline.drain().await.unwrap();
        assert!(h.dst.object("data/a").is_none());

        assert_eq!(h.find().await.enqueued, 1);
        h.pipeline.drain().await.unwrap();
        assert_eq!(h.dst.object("data/a").unwrap().data, "12345");
        let row = h.ledger.get("src/data/a").await.unwrap().unwrap();
        assert_eq!(row.action, JobAction::Transfer);
        assert_eq!(row.status, JobStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_redelivered_after_rejected_send() {
        let h = harness_with(|c| c.source.event_mode = EventMode::Create).await;
        h.src.insert("data/a", "12345");
        let body = notification("ObjectCreated:Put", "data/a", "0D");

        let trigger = h.pipeline.event_trigger();
        h.queue.fail_sends(1);
        assert!(trigger.handle_notification(&body).await.is_err());

        let report = trigger.handle_notification(&body).await.unwrap();
        assert_eq!((report.enqueued, report.stale), (1, 0));
        h.pipeline.drain().await.unwrap();
        assert_eq!(h.dst.object("data/a").unwrap().data, "12345");
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_notification_on_queue_processed() {
        let h = harness_with(|c| c.source.event_mode = EventMode::Create).await;
        h.src.insert("data/a", "12345");
        h.queue
            .send(notification("ObjectCreated:Put", "data/a", "01"))
            .await
            .unwrap();
        h.pipeline.drain().await.unwrap();
        assert!(h.dst.object("data/a").is_some());
    }
}
