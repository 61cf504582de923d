//! Event Egress - outbound change-event publishing
//!
//! Publishers take finished change events and hand them to the message bus
//! with partition keys guaranteeing per-key order. Delivery is
//! at-least-once; consumers deduplicate by `event_id`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use tracing::trace;

use crate::error::CoreError;
use crate::messages::OutboundEvent;

/// Seam to the message bus
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: OutboundEvent) -> Result<(), CoreError>;

    /// Events handed over so far
    fn published_count(&self) -> u64;
}

// ============================================================
// QUEUE PUBLISHER
// ============================================================

/// Bounded-queue publisher backing the bus producer pool.
///
/// Push order equals publish order, so per-key FIFO holds as long as each
/// key is produced by one stage worker - which the shard layout guarantees.
pub struct QueuePublisher {
    queue: ArrayQueue<OutboundEvent>,
    published: AtomicU64,
}

impl QueuePublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            published: AtomicU64::new(0),
        }
    }

    /// Drain for the bus producer loop
    pub fn pop(&self) -> Option<OutboundEvent> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl EventPublisher for QueuePublisher {
    fn publish(&self, event: OutboundEvent) -> Result<(), CoreError> {
        let mut event = event;
        // Backpressure: spin until the producer pool drains the queue
        loop {
            match self.queue.push(event) {
                Ok(()) => break,
                Err(rejected) => {
                    event = rejected;
                    std::hint::spin_loop();
                }
            }
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!("Outbound event enqueued");
        Ok(())
    }

    fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

// ============================================================
// COLLECTING PUBLISHER (tests / replay capture)
// ============================================================

/// Publisher that retains everything it saw, in publish order
#[derive(Default)]
pub struct CollectingPublisher {
    events: Mutex<Vec<OutboundEvent>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one partition key, in publish order
    pub fn events_for_key(&self, partition_key: &str) -> Vec<OutboundEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.partition_key() == partition_key)
            .cloned()
            .collect()
    }
}

impl EventPublisher for CollectingPublisher {
    fn publish(&self, event: OutboundEvent) -> Result<(), CoreError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn published_count(&self) -> u64 {
        self.events.lock().unwrap().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Position, PositionKey};
    use chrono::NaiveDate;

    fn position_event(book: &str) -> OutboundEvent {
        let key = PositionKey::new(
            book,
            "AAPL",
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
        );
        OutboundEvent::position_update(Position::new(key), None)
    }

    #[test]
    fn test_queue_publisher_round_trip() {
        let publisher = QueuePublisher::new(8);
        publisher.publish(position_event("EQ-01")).unwrap();
        publisher.publish(position_event("EQ-02")).unwrap();

        assert_eq!(publisher.published_count(), 2);
        let first = publisher.pop().unwrap();
        assert_eq!(first.partition_key(), "EQ-01:AAPL");
        assert_eq!(first.header().source, "CALCULATION_CORE");
        assert!(publisher.pop().is_some());
        assert!(publisher.pop().is_none());
    }

    #[test]
    fn test_collecting_publisher_filters_by_key() {
        let publisher = CollectingPublisher::new();
        publisher.publish(position_event("EQ-01")).unwrap();
        publisher.publish(position_event("EQ-01")).unwrap();
        publisher.publish(position_event("EQ-02")).unwrap();

        assert_eq!(publisher.events_for_key("EQ-01:AAPL").len(), 2);
        assert_eq!(publisher.events_for_key("EQ-02:AAPL").len(), 1);
    }
}
