//! Event Ingress - partitioned stream intake
//!
//! Routes inbound events onto engine shards by partition key, preserving
//! per-partition FIFO end to end. Events whose references cannot be resolved
//! yet are parked and retried with exponential back-off; exhausted retries
//! dead-letter with a structured error record.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rustc_hash::FxHasher;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::CoreError;
use crate::messages::InboundEvent;

// ============================================================
// SHARD ROUTING
// ============================================================

/// Stable partition-key -> shard mapping
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shard_count: usize,
}

impl ShardRouter {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Same key, same shard - this is the per-key ordering guarantee
    pub fn route(&self, partition_key: &str) -> usize {
        let mut hasher = FxHasher::default();
        partition_key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shard_count
    }
}

// ============================================================
// PARK & RETRY
// ============================================================

/// Back-off schedule for parked events
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial: Duration::from_millis(config.backoff_initial_ms),
            factor: config.backoff_factor,
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry `attempt` (0-based): initial * factor^attempt, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1) as u64;
        let mult = factor.saturating_pow(attempt.min(16));
        let delay = self
            .initial
            .saturating_mul(u32::try_from(mult).unwrap_or(u32::MAX));
        delay.min(self.max)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

/// An event waiting out its back-off
#[derive(Debug, Clone)]
pub struct ParkedEvent {
    pub event: InboundEvent,
    pub attempts: u32,
    pub retry_at: Instant,
}

/// Shard-local park bench. Events keep their arrival order per partition key
/// because the bench is scanned FIFO and re-parks preserve the slot order.
#[derive(Debug, Default)]
pub struct ParkBench {
    parked: VecDeque<ParkedEvent>,
}

impl ParkBench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&mut self, event: InboundEvent, attempts: u32, policy: &RetryPolicy) {
        let retry_at = Instant::now() + policy.backoff(attempts);
        warn!(
            partition_key = event.partition_key(),
            attempts, "Event parked for retry"
        );
        self.parked.push_back(ParkedEvent {
            event,
            attempts: attempts + 1,
            retry_at,
        });
    }

    /// Next event whose back-off elapsed
    pub fn take_due(&mut self, now: Instant) -> Option<ParkedEvent> {
        let idx = self.parked.iter().position(|p| p.retry_at <= now)?;
        self.parked.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}

// ============================================================
// DEAD LETTERS
// ============================================================

/// Structured record of an event the core gave up on
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: InboundEvent,
    pub error_code: &'static str,
    pub detail: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Shared dead-letter log
#[derive(Default)]
pub struct DeadLetterLog {
    letters: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: InboundEvent, err: &CoreError, attempts: u32) {
        error!(
            partition_key = event.partition_key(),
            code = err.code(),
            attempts,
            error = %err,
            "Event dead-lettered"
        );
        self.letters.lock().unwrap().push(DeadLetter {
            event,
            error_code: err.code(),
            detail: err.to_string(),
            attempts,
            dead_lettered_at: Utc::now(),
        });
    }

    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.letters.lock().unwrap().len()
    }
}
