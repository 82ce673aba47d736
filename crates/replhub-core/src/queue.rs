//! Durable work queue capability and the in-memory backend.
//!
//! Delivery is at least once. A received message is leased for a visibility
//! timeout; if the lease expires without an ack the message becomes visible
//! again. A message that is due again after `max_receive_count` receives is
//! moved to the dead-letter queue instead of being delivered.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ReplError, Result};
use crate::model::now_ms;

/// Largest batch accepted by [`WorkQueue::send_batch`].
pub const MAX_SEND_BATCH: usize = 10;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Stable message identifier.
    pub message_id: String,
    /// Lease handle; only the latest receipt can ack.
    pub receipt: String,
    /// Message body.
    pub body: String,
    /// Receives so far, including this one.
    pub receive_count: u32,
    /// When the message was sent (milliseconds since epoch).
    pub sent_at: u64,
}

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Original message identifier.
    pub message_id: String,
    /// Message body.
    pub body: String,
    /// Receives before it was parked.
    pub receive_count: u32,
    /// When the message was originally sent (milliseconds since epoch).
    pub sent_at: u64,
}

/// Messages waiting and leased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages available for receive.
    pub visible: u64,
    /// Messages leased to a consumer.
    pub in_flight: u64,
}

impl QueueDepth {
    /// Visible plus in flight, the scaling signal.
    pub fn total(&self) -> u64 {
        self.visible + self.in_flight
    }

    /// Returns true if nothing is waiting or leased.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Durable at-least-once queue with dead-letter redirection.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue one message. Returns its id.
    async fn send(&self, body: String) -> Result<String>;

    /// Enqueue up to [`MAX_SEND_BATCH`] messages.
    async fn send_batch(&self, bodies: Vec<String>) -> Result<Vec<String>> {
        if bodies.len() > MAX_SEND_BATCH {
            return Err(ReplError::Queue {
                msg: format!(
                    "batch of {} exceeds the limit of {}",
                    bodies.len(),
                    MAX_SEND_BATCH
                ),
            });
        }
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            ids.push(self.send(body).await?);
        }
        Ok(ids)
    }

    /// Lease up to `max` visible messages for `visibility`.
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<ReceivedMessage>>;

    /// Delete a leased message. Fails if `receipt` is no longer current.
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Current depth.
    async fn depth(&self) -> Result<QueueDepth>;

    /// Messages parked in the dead-letter queue.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

/// Counters kept by [`MemoryQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages sent.
    pub sent: u64,
    /// Deliveries, counting redeliveries.
    pub received: u64,
    /// Messages acknowledged.
    pub acked: u64,
    /// Messages moved to the dead-letter queue.
    pub dead_lettered: u64,
}

struct Entry {
    message_id: String,
    body: String,
    receive_count: u32,
    sent_at: u64,
    visible_at: Instant,
    receipt: Option<String>,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    dead: Vec<DeadLetter>,
    stats: QueueStats,
    send_faults: u32,
}

/// In-process queue honouring visibility timeouts and the receive limit.
pub struct MemoryQueue {
    max_receive_count: u32,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    /// Create a queue that parks messages after `max_receive_count` receives.
    pub fn new(max_receive_count: u32) -> Self {
        Self {
            max_receive_count: max_receive_count.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    /// Reject the next `times` sends.
    pub fn fail_sends(&self, times: u32) {
        self.state.lock().send_faults = times;
    }

    // Move due messages that used up their receives to the DLQ.
    fn redrive(&self, state: &mut QueueState, now: Instant) {
        let limit = self.max_receive_count;
        let mut i = 0;
        while i < state.entries.len() {
            let due = state.entries[i].visible_at <= now;
            if due && state.entries[i].receive_count >= limit {
                let entry = state.entries.remove(i);
                warn!(
                    message_id = %entry.message_id,
                    receive_count = entry.receive_count,
                    "moving message to dead-letter queue"
                );
                state.dead.push(DeadLetter {
                    message_id: entry.message_id,
                    body: entry.body,
                    receive_count: entry.receive_count,
                    sent_at: entry.sent_at,
                });
                state.stats.dead_lettered += 1;
            } else {
                i += 1;
            }
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, body: String) -> Result<String> {
        let mut state = self.state.lock();
        if state.send_faults > 0 {
            state.send_faults -= 1;
            return Err(ReplError::Queue {
                msg: "send rejected by injected fault".into(),
            });
        }
        let message_id = uuid::Uuid::new_v4().to_string();
        state.entries.push(Entry {
            message_id: message_id.clone(),
            body,
            receive_count: 0,
            sent_at: now_ms(),
            visible_at: Instant::now(),
            receipt: None,
        });
        state.stats.sent += 1;
        Ok(message_id)
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.redrive(&mut state, now);

        let mut out = Vec::new();
        for entry in state.entries.iter_mut() {
            if out.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let receipt = uuid::Uuid::new_v4().to_string();
            entry.receive_count += 1;
            entry.visible_at = now + visibility;
            entry.receipt = Some(receipt.clone());
            out.push(ReceivedMessage {
                message_id: entry.message_id.clone(),
                receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
                sent_at: entry.sent_at,
            });
        }
        state.stats.received += out.len() as u64;
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let pos = state
            .entries
            .iter()
            .position(|e| e.receipt.as_deref() == Some(receipt) && e.visible_at > now);
        match pos {
            Some(i) => {
                let entry = state.entries.remove(i);
                state.stats.acked += 1;
                debug!(message_id = %entry.message_id, "acknowledged message");
                Ok(())
            }
            None => Err(ReplError::Queue {
                msg: "receipt is stale or unknown".into(),
            }),
        }
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.redrive(&mut state, now);
        let in_flight = state.entries.iter().filter(|e| e.visible_at > now).count() as u64;
        Ok(QueueDepth {
            visible: state.entries.len() as u64 - in_flight,
            in_flight,
        })
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().dead.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(900);

    mod delivery {
        use super::*;

        #[tokio::test]
        async fn test_send_receive_ack() {
            let q = MemoryQueue::new(5);
            q.send("a".into()).await.unwrap();
            q.send("b".into()).await.unwrap();

            let msgs = q.receive(1, LEASE).await.unwrap();
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].body, "a");
            assert_eq!(msgs[0].receive_count, 1);
            assert_eq!(q.depth().await.unwrap(), QueueDepth { visible: 1, in_flight: 1 });

            q.ack(&msgs[0].receipt).await.unwrap();
            assert_eq!(q.depth().await.unwrap().total(), 1);
            assert_eq!(q.stats().acked, 1);
        }

        #[tokio::test]
        async fn test_rejected_send_stores_nothing() {
            let q = MemoryQueue::new(5);
            q.fail_sends(1);
            let err = q.send("a".into()).await.unwrap_err();
            assert!(matches!(err, ReplError::Queue { .. }));
            assert!(q.depth().await.unwrap().is_empty());
            q.send("a".into()).await.unwrap();
            assert_eq!(q.stats().sent, 1);
        }

        #[tokio::test]
        async fn test_leased_message_not_redelivered() {
            let q = MemoryQueue::new(5);
            q.send("a".into()).await.unwrap();
            assert_eq!(q.receive(10, LEASE).await.unwrap().len(), 1);
            assert!(q.receive(10, LEASE).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_batch_limit() {
            let q = MemoryQueue::new(5);
            let ok: Vec<String> = (0..10).map(|i| i.to_string()).collect();
            assert_eq!(q.send_batch(ok).await.unwrap().len(), 10);
            let too_many: Vec<String> = (0..11).map(|i| i.to_string()).collect();
            assert!(q.send_batch(too_many).await.is_err());
            assert_eq!(q.depth().await.unwrap().visible, 10);
        }

        #[tokio::test]
        async fn test_unknown_receipt_rejected() {
            let q = MemoryQueue::new(5);
            assert!(matches!(
                q.ack("nope").await.unwrap_err(),
                ReplError::Queue { .. }
            ));
        }
    }

    mod visibility {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_redelivered_after_timeout() {
            let q = MemoryQueue::new(5);
            q.send("a".into()).await.unwrap();
            let first = q.receive(1, Duration::from_secs(30)).await.unwrap();

            tokio::time::advance(Duration::from_secs(29)).await;
            assert!(q.receive(1, Duration::from_secs(30)).await.unwrap().is_empty());

            tokio::time::advance(Duration::from_secs(2)).await;
            let second = q.receive(1, Duration::from_secs(30)).await.unwrap();
            assert_eq!(second.len(), 1);
            assert_eq!(second[0].message_id, first[0].message_id);
            assert_eq!(second[0].receive_count, 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_stale_receipt_cannot_ack() {
            let q = MemoryQueue::new(5);
            q.send("a".into()).await.unwrap();
            let first = q.receive(1, Duration::from_secs(10)).await.unwrap();
            tokio::time::advance(Duration::from_secs(11)).await;

            // Expired lease: the old receipt no longer owns the message.
            assert!(q.ack(&first[0].receipt).await.is_err());

            let second = q.receive(1, Duration::from_secs(10)).await.unwrap();
            assert!(q.ack(&first[0].receipt).await.is_err());
            q.ack(&second[0].receipt).await.unwrap();
            assert!(q.depth().await.unwrap().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_dead_letter_after_max_receives() {
            let q = MemoryQueue::new(3);
            q.send("poison".into()).await.unwrap();
            for attempt in 1..=3 {
                let msgs = q.receive(1, Duration::from_secs(5)).await.unwrap();
                assert_eq!(msgs[0].receive_count, attempt);
                tokio::time::advance(Duration::from_secs(6)).await;
            }

            assert!(q.receive(1, Duration::from_secs(5)).await.unwrap().is_empty());
            assert!(q.depth().await.unwrap().is_empty());
            let dead = q.dead_letters().await.unwrap();
            assert_eq!(dead.len(), 1);
            assert_eq!(dead[0].body, "poison");
            assert_eq!(dead[0].receive_count, 3);
            assert_eq!(q.stats().dead_lettered, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_depth_counts_in_flight() {
            let q = MemoryQueue::new(5);
            for i in 0..3 {
                q.send(i.to_string()).await.unwrap();
            }
            q.receive(2, Duration::from_secs(60)).await.unwrap();
            assert_eq!(q.depth().await.unwrap(), QueueDepth { visible: 1, in_flight: 2 });
            tokio::time::advance(Duration::from_secs(61)).await;
            assert_eq!(q.depth().await.unwrap(), QueueDepth { visible: 3, in_flight: 0 });
        }
    }
}
