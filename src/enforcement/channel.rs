//! Best-effort event channel
//!
//! Bounded multi-producer / single-consumer queue of [`EventRecord`]s.
//! Producers never wait: a record that does not fit, or that has nobody to
//! receive it, is dropped on the spot and counted.
//!
//! ```text
//!  unit 0 ──publish──┐
//!  unit 1 ──publish──┼──► [ bounded queue ] ──recv──► consumer
//!  unit N ──publish──┘          │
//!                               └── full / closed ──► dropped += 1
//! ```
//!
//! Records from one producer arrive in the order they were published.
//! Nothing is promised about interleaving between producers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use heimdall_common::EventRecord;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Default queue depth, matching the filter map size.
pub const DEFAULT_CAPACITY: usize = 1024;

/// What happened to a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// Queued for the consumer
    Sent,
    /// Queue was full; record dropped
    Saturated,
    /// Consumer is gone; record dropped
    Detached,
}

/// Create a channel holding at most `capacity` undelivered records.
pub fn event_channel(capacity: usize) -> (EventProducer, EventConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventProducer {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EventConsumer { rx, dropped },
    )
}

/// Sending half. Cheap to clone; one clone per producer.
#[derive(Debug, Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<EventRecord>,
    dropped: Arc<AtomicU64>,
}

impl EventProducer {
    /// Hand a fully populated record to the channel without blocking.
    pub fn publish(&self, record: &EventRecord) -> Publish {
        match self.tx.try_send(*record) {
            Ok(()) => Publish::Sent,
            Err(TrySendError::Full(_)) => {
                self.note_dropped(1);
                Publish::Saturated
            }
            Err(TrySendError::Closed(_)) => {
                self.note_dropped(1);
                Publish::Detached
            }
        }
    }

    /// Account for records lost before they reached this producer
    /// (e.g. a kernel perf buffer overflow).
    pub fn note_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Whether the consumer has gone away.
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, owned by the single external consumer.
#[derive(Debug)]
pub struct EventConsumer {
    rx: mpsc::Receiver<EventRecord>,
    dropped: Arc<AtomicU64>,
}

impl EventConsumer {
    /// Wait for the next record. `None` once every producer is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.rx.recv().await
    }

    /// Take a record if one is queued.
    pub fn try_recv(&mut self) -> Option<EventRecord> {
        match self.rx.try_recv() {
            Ok(record) => Some(record),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<EventRecord> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Total records dropped so far, across all producers.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting records; later publishes report `Detached`.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heimdall_common::comm_from_bytes;

    fn record(pid: u32) -> EventRecord {
        let mut r = EventRecord::zeroed();
        r.fill(pid, 1000, 62, 500, comm_from_bytes(b"test"));
        r
    }

    #[tokio::test]
    async fn test_publish_and_recv() {
        let (producer, mut consumer) = event_channel(4);
        assert_eq!(producer.publish(&record(1)), Publish::Sent);

        let received = consumer.recv().await.unwrap();
        assert_eq!(received, record(1));
        assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (producer, mut consumer) = event_channel(2);
        assert_eq!(producer.publish(&record(1)), Publish::Sent);
        assert_eq!(producer.publish(&record(2)), Publish::Sent);
        assert_eq!(producer.publish(&record(3)), Publish::Saturated);

        let pids: Vec<u32> = consumer.drain().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![1, 2]);
        assert_eq!(consumer.dropped(), 1);
    }

    #[test]
    fn test_detached_consumer_drops() {
        let (producer, consumer) = event_channel(2);
        drop(consumer);

        assert!(producer.is_detached());
        assert_eq!(producer.publish(&record(1)), Publish::Detached);
    }

    #[test]
    fn test_closed_consumer_counts_drops() {
        let (producer, mut consumer) = event_channel(2);
        consumer.close();

        assert_eq!(producer.publish(&record(1)), Publish::Detached);
        assert_eq!(consumer.dropped(), 1);
    }

    #[test]
    fn test_single_producer_order_preserved() {
        let (producer, mut consumer) = event_channel(16);
        for pid in 0..10 {
            producer.publish(&record(pid));
        }

        let pids: Vec<u32> = consumer.drain().iter().map(|r| r.pid).collect();
        assert_eq!(pids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_external_losses_are_counted() {
        let (producer, consumer) = event_channel(1);
        producer.note_dropped(5);
        assert_eq!(consumer.dropped(), 5);
    }

    #[tokio::test]
    async fn test_recv_ends_when_producers_gone() {
        let (producer, mut consumer) = event_channel(1);
        drop(producer);
        assert!(consumer.recv().await.is_none());
    }
}
