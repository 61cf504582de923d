//! Pipeline - sharded calculation pipeline
//!
//! Staged workers cooperating over lock-free ring buffers
//! (crossbeam-queue::ArrayQueue), one thread per shard.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  position shard queues  ┌──────────────────┐  security queues  ┌──────────────────┐
//! │   Ingestion  │ ──────(by bookId)─────▶ │ Position Engine  │ ───(by secId)───▶ │ Inventory Engine │
//! │  (dispatch)  │                         │  shard 0..P      │                   │   shard 0..I     │
//! └──────┬───────┘                         └──────────────────┘                   └────────┬─────────┘
//!        │ inventory/contract events                 │                                     │
//!        └──────────(by secId)──────────────────────────────────────────────────▶         │ limit queue
//!                                                    │                                     ▼
//!                                                    │ POSITION_UPDATE            ┌──────────────────┐
//!                                                    ▼                            │   Limit Engine   │
//!                                                 Egress  ◀──────────────────────-│     worker       │
//!                                                                                 └──────────────────┘
//! ```
//!
//! # Key Design
//!
//! - **Per-key serialization**: one book hashes to one position shard, one
//!   security to one inventory shard; inside a shard processing is strictly
//!   sequential, so per-(book, security) and per-security order holds.
//! - **Backpressure**: the dispatcher pauses a queue past the high
//!   watermark and resumes below the low watermark.
//! - **Park & retry**: unresolved references back off per the retry policy
//!   and dead-letter on exhaustion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_queue::ArrayQueue;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core_types::{BusinessDate, SecurityId};
use crate::egress::EventPublisher;
use crate::error::CoreError;
use crate::ingress::{DeadLetter, DeadLetterLog, ParkBench, RetryPolicy, ShardRouter};
use crate::inventory::InventoryEngine;
use crate::limits::LimitEngine;
use crate::messages::{InboundEvent, OutboundEvent};
use crate::position::PositionEngine;
use crate::refdata::RefData;
use crate::repository::MemoryStore;
use crate::rules::RuleEngine;

// ============================================================
// SHUTDOWN SIGNAL
// ============================================================

/// Cooperative shutdown flag shared by every stage
#[derive(Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

// ============================================================
// PIPELINE STATS
// ============================================================

/// Cross-stage counters, updated with relaxed atomics
#[derive(Default)]
pub struct PipelineStats {
    pub events_ingested: AtomicU64,
    pub position_updates: AtomicU64,
    pub inventory_updates: AtomicU64,
    pub limit_updates: AtomicU64,
    pub validation_failures: AtomicU64,
    pub parked: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub deadline_breaches: AtomicU64,
    pub backpressure_pauses: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of a pipeline run over a bounded event stream
pub struct PipelineResult {
    pub stats: Arc<PipelineStats>,
    pub dead_letters: Vec<DeadLetter>,
}

// ============================================================
// INVENTORY STAGE TASKS
// ============================================================

/// Work items for an inventory shard, FIFO per security
enum InventoryTask {
    /// External availability or contract event from the bus
    Event(InboundEvent),
    /// A position of this security changed upstream
    PositionChanged(SecurityId),
}

// ============================================================
// PIPELINE RUNNER
// ============================================================

/// Shared collaborators handed to the pipeline
pub struct PipelineContext {
    pub store: Arc<MemoryStore>,
    pub refdata: Arc<RefData>,
    pub rules: Arc<RuleEngine>,
    pub limits: Arc<LimitEngine>,
    pub publisher: Arc<dyn EventPublisher>,
    pub config: AppConfig,
}

/// Run a bounded event stream through the full calculation pipeline.
///
/// Threads: 1 dispatcher + P position shards + I inventory shards + 1 limit
/// worker. Returns once every stage drained, including park benches.
pub fn run_calculation_pipeline(
    events: Vec<InboundEvent>,
    business_date: BusinessDate,
    ctx: PipelineContext,
) -> PipelineResult {
    let shard_count = ctx.config.effective_shard_count();
    let high = ctx.config.sharding.queue_high_watermark;
    let low = ctx.config.sharding.queue_low_watermark;
    let deadline = Duration::from_millis(ctx.config.deadlines.event_processing_ms);
    let policy = RetryPolicy::from_config(&ctx.config.retry);
    let jp_cutoff = ctx.config.markets.jp_cutoff_time_utc;

    let router = ShardRouter::new(shard_count);
    let stats = Arc::new(PipelineStats::new());
    // Staged shutdown: a stage only drains once everything upstream of it
    // has finished producing.
    let position_shutdown = Arc::new(ShutdownSignal::new());
    let inventory_shutdown = Arc::new(ShutdownSignal::new());
    let limit_shutdown = Arc::new(ShutdownSignal::new());
    let dead_letters = Arc::new(DeadLetterLog::new());

    let position_queues: Vec<Arc<ArrayQueue<InboundEvent>>> = (0..shard_count)
        .map(|_| Arc::new(ArrayQueue::new(high.max(1))))
        .collect();
    let inventory_queues: Vec<Arc<ArrayQueue<InventoryTask>>> = (0..shard_count)
        .map(|_| Arc::new(ArrayQueue::new(high.max(1))))
        .collect();
    let limit_queue: Arc<ArrayQueue<SecurityId>> = Arc::new(ArrayQueue::new(high.max(1)));

    // ================================================================
    // STAGE 1: Dispatcher
    // ================================================================
    let t_dispatch: JoinHandle<()> = {
        let position_queues = position_queues.clone();
        let inventory_queues = inventory_queues.clone();
        let stats = stats.clone();
        let dead_letters = dead_letters.clone();
        thread::spawn(move || {
            for event in events {
                if let Err(e) = event.validate() {
                    PipelineStats::incr(&stats.validation_failures);
                    dead_letters.push(event, &e, 0);
                    continue;
                }

                PipelineStats::incr(&stats.events_ingested);
                let shard = router.route(event.partition_key());
                match &event {
                    InboundEvent::Trade(_) | InboundEvent::Position(_) => {
                        push_with_watermarks(&position_queues[shard], event, high, low, &stats);
                    }
                    InboundEvent::Inventory(_) | InboundEvent::Contract(_) => {
                        push_with_watermarks(
                            &inventory_queues[shard],
                            InventoryTask::Event(event),
                            high,
                            low,
                            &stats,
                        );
                    }
                }
            }
        })
    };

    // ================================================================
    // STAGE 2: Position shards
    // ================================================================
    let mut position_handles = Vec::with_capacity(shard_count);
    for shard_id in 0..shard_count {
        let queue = position_queues[shard_id].clone();
        let inventory_queues = inventory_queues.clone();
        let stats = stats.clone();
        let shutdown = position_shutdown.clone();
        let dead_letters = dead_letters.clone();
        let policy = policy.clone();
        let publisher = ctx.publisher.clone();
        let mut engine = PositionEngine::new(ctx.store.clone(), ctx.refdata.clone(), jp_cutoff);

        position_handles.push(thread::spawn(move || {
            let mut bench = ParkBench::new();

            loop {
                let mut did_work = false;

                let next = bench
                    .take_due(Instant::now())
                    .map(|p| (p.event, p.attempts))
                    .or_else(|| queue.pop().map(|e| (e, 0)));

                if let Some((event, attempts)) = next {
                    did_work = true;
                    let started = Instant::now();

                    let result = match &event {
                        InboundEvent::Trade(trade) => {
                            engine.process_trade_event(trade, business_date, Utc::now())
                        }
                        InboundEvent::Position(snapshot) => engine.process_position_event(snapshot),
                        _ => Err(CoreError::InvalidField {
                            field: "stream",
                            reason: "not a position-stage event".to_string(),
                        }),
                    };

                    match result {
                        Ok(position) => {
                            let security_id = position.key.security_id.clone();
                            publisher
                                .publish(OutboundEvent::position_update(position, None))
                                .ok();
                            PipelineStats::incr(&stats.position_updates);

                            let shard = router.route(&security_id);
                            push_with_watermarks(
                                &inventory_queues[shard],
                                InventoryTask::PositionChanged(security_id),
                                high,
                                low,
                                &stats,
                            );
                        }
                        Err(e) if e.is_retryable() => {
                            if policy.exhausted(attempts) {
                                PipelineStats::incr(&stats.dead_lettered);
                                dead_letters.push(event, &e, attempts);
                            } else {
                                PipelineStats::incr(&stats.parked);
                                bench.park(event, attempts, &policy);
                            }
                        }
                        Err(e) => {
                            PipelineStats::incr(&stats.validation_failures);
                            dead_letters.push(event, &e, attempts);
                        }
                    }

                    if started.elapsed() > deadline {
                        PipelineStats::incr(&stats.deadline_breaches);
                        warn!(shard_id, "Position stage breached the processing deadline");
                    }
                }

                if shutdown.is_shutdown_requested() && queue.is_empty() && bench.is_empty() {
                    break;
                }
                if !did_work {
                    // Sleeping (not spinning) lets park back-offs elapse
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }));
    }

    // ================================================================
    // STAGE 3: Inventory shards
    // ================================================================
    let mut inventory_handles = Vec::with_capacity(shard_count);
    for shard_id in 0..shard_count {
        let queue = inventory_queues[shard_id].clone();
        let limit_queue = limit_queue.clone();
        let stats = stats.clone();
        let shutdown = inventory_shutdown.clone();
        let dead_letters = dead_letters.clone();
        let policy = policy.clone();
        let publisher = ctx.publisher.clone();
        let mut engine = InventoryEngine::new(
            ctx.store.clone(),
            ctx.rules.clone(),
            ctx.refdata.clone(),
            jp_cutoff,
        );

        inventory_handles.push(thread::spawn(move || {
            let mut bench = ParkBench::new();

            loop {
                let mut did_work = false;

                let next = bench
                    .take_due(Instant::now())
                    .map(|p| (InventoryTask::Event(p.event), p.attempts))
                    .or_else(|| queue.pop().map(|t| (t, 0)));

                if let Some((task, attempts)) = next {
                    did_work = true;
                    let started = Instant::now();

                    let (result, parkable) = match &task {
                        InventoryTask::Event(InboundEvent::Inventory(ev)) => {
                            (engine.process_inventory_event(ev, Utc::now()), true)
                        }
                        InventoryTask::Event(InboundEvent::Contract(ev)) => (
                            engine.process_contract_event(ev, business_date, Utc::now()),
                            true,
                        ),
                        InventoryTask::PositionChanged(security_id) => (
                            engine.calculate_inventory_for_security(
                                security_id,
                                business_date,
                                Utc::now(),
                            ),
                            false,
                        ),
                        InventoryTask::Event(_) => (
                            Err(CoreError::InvalidField {
                                field: "stream",
                                reason: "not an inventory-stage event".to_string(),
                            }),
                            false,
                        ),
                    };

                    match result {
                        Ok(rows) => {
                            let mut touched: Option<SecurityId> = None;
                            for row in rows {
                                touched = Some(row.key.security_id.clone());
                                publisher
                                    .publish(OutboundEvent::inventory_update(row, None))
                                    .ok();
                                PipelineStats::incr(&stats.inventory_updates);
                            }
                            if let Some(security_id) = touched {
                                push_with_watermarks(
                                    &limit_queue,
                                    security_id,
                                    high,
                                    low,
                                    &stats,
                                );
                            }
                        }
                        Err(e) if e.is_retryable() && parkable => {
                            if let InventoryTask::Event(event) = task {
                                if policy.exhausted(attempts) {
                                    PipelineStats::incr(&stats.dead_lettered);
                                    dead_letters.push(event, &e, attempts);
                                } else {
                                    PipelineStats::incr(&stats.parked);
                                    bench.park(event, attempts, &policy);
                                }
                            }
                        }
                        Err(e) => {
                            PipelineStats::incr(&stats.validation_failures);
                            if let InventoryTask::Event(event) = task {
                                dead_letters.push(event, &e, attempts);
                            }
                        }
                    }

                    if started.elapsed() > deadline {
                        PipelineStats::incr(&stats.deadline_breaches);
                        warn!(shard_id, "Inventory stage breached the processing deadline");
                    }
                }

                if shutdown.is_shutdown_requested() && queue.is_empty() && bench.is_empty() {
                    break;
                }
                if !did_work {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }));
    }

    // ================================================================
    // STAGE 4: Limit worker
    // ================================================================
    let t_limits: JoinHandle<()> = {
        let limit_queue = limit_queue.clone();
        let stats = stats.clone();
        let shutdown = limit_shutdown.clone();
        let publisher = ctx.publisher.clone();
        let store = ctx.store.clone();
        let refdata = ctx.refdata.clone();
        let limits = ctx.limits.clone();

        thread::spawn(move || {
            loop {
                let mut did_work = false;

                if let Some(security_id) = limit_queue.pop() {
                    did_work = true;

                    let positions = store.positions_for_security(&security_id, business_date);
                    let (clients, aus) = limits.calculate_limits(&positions, business_date);

                    if refdata.market_of(&security_id) == "TW" {
                        for limit in limits.apply_market_specific_rules("TW", business_date) {
                            publisher
                                .publish(OutboundEvent::au_limit_update(limit, None))
                                .ok();
                            PipelineStats::incr(&stats.limit_updates);
                        }
                    }

                    for limit in clients {
                        publisher
                            .publish(OutboundEvent::client_limit_update(limit, None))
                            .ok();
                        PipelineStats::incr(&stats.limit_updates);
                    }
                    for limit in aus {
                        publisher
                            .publish(OutboundEvent::au_limit_update(limit, None))
                            .ok();
                        PipelineStats::incr(&stats.limit_updates);
                    }
                }

                if shutdown.is_shutdown_requested() && limit_queue.is_empty() {
                    break;
                }
                if !did_work {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    // ================================================================
    // Drain and join
    // ================================================================
    t_dispatch.join().expect("dispatcher thread panicked");

    position_shutdown.request_shutdown();
    for handle in position_handles {
        handle.join().expect("position shard panicked");
    }
    inventory_shutdown.request_shutdown();
    for handle in inventory_handles {
        handle.join().expect("inventory shard panicked");
    }
    limit_shutdown.request_shutdown();
    t_limits.join().expect("limit worker panicked");

    info!(
        ingested = stats.events_ingested.load(Ordering::Relaxed),
        position_updates = stats.position_updates.load(Ordering::Relaxed),
        inventory_updates = stats.inventory_updates.load(Ordering::Relaxed),
        limit_updates = stats.limit_updates.load(Ordering::Relaxed),
        dead_lettered = stats.dead_lettered.load(Ordering::Relaxed),
        "Pipeline drained"
    );

    PipelineResult {
        stats,
        dead_letters: dead_letters.drain(),
    }
}

/// Push with watermark backpressure: pause while the queue sits above the
/// high watermark, resume once it drains below the low watermark.
fn push_with_watermarks<T>(
    queue: &ArrayQueue<T>,
    item: T,
    high: usize,
    low: usize,
    stats: &PipelineStats,
) {
    if queue.len() >= high.max(1) {
        PipelineStats::incr(&stats.backpressure_pauses);
        while queue.len() > low {
            std::hint::spin_loop();
        }
    }

    let mut item = item;
    loop {
        match queue.push(item) {
            Ok(()) => break,
            Err(rejected) => {
                item = rejected;
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown_requested());
        signal.request_shutdown();
        assert!(signal.is_shutdown_requested());
    }

    #[test]
    fn test_watermark_push_below_high_is_immediate() {
        let queue: ArrayQueue<u32> = ArrayQueue::new(8);
        let stats = PipelineStats::new();
        push_with_watermarks(&queue, 7, 8, 2, &stats);
        assert_eq!(queue.pop(), Some(7));
        assert_eq!(stats.backpressure_pauses.load(Ordering::Relaxed), 0);
    }
}
