//! Position Engine
//!
//! The single-threaded core service that owns per-(book, security, date)
//! position state for its shard.
//!
//! # Responsibilities
//!
//! 1. **Trade application** - settlement-ladder bucketing and contractual
//!    quantity updates, with replay protection by trade ID
//! 2. **Snapshot absorption** - start-of-day and custodian position events
//! 3. **Derivations** - current and projected net, always recomputed together
//!
//! # Thread Safety
//!
//! A PositionEngine instance is driven by exactly one shard worker. All
//! events for one book hash to the same shard, which is what serializes
//! updates per (book, security) without locks.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::core_types::{BusinessDate, Qty};
use crate::error::CoreError;
use crate::messages::{PositionEvent, TradeDataEvent, TradeSide};
use crate::models::{CalculationStatus, LADDER_DAYS, Position, PositionKey, SettlementLadder};
use crate::refdata::RefData;
use crate::repository::MemoryStore;
use crate::rules::engine::RuleEngine;
use crate::rules::model::{RuleContext, attrs};

// ============================================================
// APPLIED TRADES (replay / reversal bookkeeping)
// ============================================================

/// Contribution of an applied trade, kept for replay detection and busts
#[derive(Debug, Clone)]
struct AppliedTrade {
    key: PositionKey,
    side: TradeSide,
    qty: Qty,
    bucket: usize,
}

/// Position engine statistics
#[derive(Debug, Default, Clone)]
pub struct PositionEngineStats {
    pub trades_applied: u64,
    pub trades_replayed: u64,
    pub trades_reversed: u64,
    pub snapshots_absorbed: u64,
    pub snapshots_rejected: u64,
    pub recalculations: u64,
    pub pending_created: u64,
}

// ============================================================
// POSITION ENGINE
// ============================================================

pub struct PositionEngine {
    store: Arc<MemoryStore>,
    refdata: Arc<RefData>,
    /// Japan SLAB booking cutoff, UTC wall-clock
    jp_cutoff_utc: NaiveTime,
    /// trade_id -> applied contribution
    applied_trades: FxHashMap<String, AppliedTrade>,
    stats: PositionEngineStats,
}

impl PositionEngine {
    pub fn new(store: Arc<MemoryStore>, refdata: Arc<RefData>, jp_cutoff_utc: NaiveTime) -> Self {
        Self {
            store,
            refdata,
            jp_cutoff_utc,
            applied_trades: FxHashMap::default(),
            stats: PositionEngineStats::default(),
        }
    }

    pub fn stats(&self) -> &PositionEngineStats {
        &self.stats
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn get_position(&self, key: &PositionKey) -> Option<Position> {
        self.store.get_position(key)
    }

    /// Settlement-ladder view for a key
    pub fn calculate_settlement_ladder(&self, key: &PositionKey) -> Option<SettlementLadder> {
        self.store.get_position(key).map(|p| p.settlement_ladder())
    }

    // ============================================================
    // TRADE PROCESSING
    // ============================================================

    /// Apply a trade to its position.
    ///
    /// # Flow
    /// 1. Contract validation, replay check
    /// 2. Reference-data resolution (unknown keys park for retry)
    /// 3. Settlement bucket selection, with the JP SLAB cutoff shift
    /// 4. Quantity mutation + derivation refresh
    ///
    /// A replayed `trade_id` is a no-op returning the current position.
    pub fn process_trade_event(
        &mut self,
        event: &TradeDataEvent,
        business_date: BusinessDate,
        now: DateTime<Utc>,
    ) -> Result<Position, CoreError> {
        event.validate()?;

        if self.applied_trades.contains_key(&event.trade_id) {
            self.stats.trades_replayed += 1;
            debug!(trade_id = %event.trade_id, "Trade replay ignored");
            let key = PositionKey::new(&event.book_id, &event.security_id, business_date);
            return self
                .store
                .get_position(&key)
                .ok_or_else(|| CoreError::NotFound(format!("position {:?}", key)));
        }

        let key = PositionKey::new(&event.book_id, &event.security_id, business_date);
        self.resolve_references(&key)?;

        let bucket = self.settlement_bucket(event, business_date, now);

        let mut position = self
            .store
            .get_position(&key)
            .unwrap_or_else(|| Position::new(key.clone()));

        match event.side {
            TradeSide::Buy => {
                position.contractual_qty += event.quantity;
                position.sd_receipt[bucket.index] += event.quantity;
            }
            TradeSide::Sell => {
                position.contractual_qty -= event.quantity;
                position.sd_deliver[bucket.index] += event.quantity;
            }
        }
        if bucket.overflowed {
            position.ladder_overflow = true;
        }

        position.calculate_projected();
        position.mark_calculated(None, None, business_date);
        self.store.put_position(position.clone());

        self.applied_trades.insert(
            event.trade_id.clone(),
            AppliedTrade {
                key,
                side: event.side,
                qty: event.quantity,
                bucket: bucket.index,
            },
        );
        self.stats.trades_applied += 1;
        Ok(position)
    }

    /// Back out a previously applied trade (bust/cancel flow).
    ///
    /// Apply-then-reverse restores the position byte-identically modulo
    /// `version` and `last_modified_at`.
    pub fn reverse_trade_event(&mut self, trade_id: &str) -> Result<Position, CoreError> {
        let applied = self
            .applied_trades
            .remove(trade_id)
            .ok_or_else(|| CoreError::NotFound(format!("trade {trade_id}")))?;

        let mut position = self
            .store
            .get_position(&applied.key)
            .ok_or_else(|| CoreError::NotFound(format!("position {:?}", applied.key)))?;

        match applied.side {
            TradeSide::Buy => {
                position.contractual_qty -= applied.qty;
                position.sd_receipt[applied.bucket] -= applied.qty;
            }
            TradeSide::Sell => {
                position.contractual_qty += applied.qty;
                position.sd_deliver[applied.bucket] -= applied.qty;
            }
        }

        position.calculate_projected();
        position.mark_calculated(None, None, applied.key.business_date);
        self.store.put_position(position.clone());
        self.stats.trades_reversed += 1;
        Ok(position)
    }

    // ============================================================
    // SNAPSHOT PROCESSING
    // ============================================================

    /// Absorb an external position snapshot.
    ///
    /// Only start-of-day events carry overwrite authority; anything else is
    /// a conflicting source and is rejected.
    pub fn process_position_event(&mut self, event: &PositionEvent) -> Result<Position, CoreError> {
        event.validate()?;

        if !event.is_start_of_day {
            self.stats.snapshots_rejected += 1;
            return Err(CoreError::ConflictingAuthority(format!(
                "{}:{}",
                event.book_id, event.security_id
            )));
        }

        let key = PositionKey::new(&event.book_id, &event.security_id, event.business_date);
        self.resolve_references(&key)?;

        let mut position = self
            .store
            .get_position(&key)
            .unwrap_or_else(|| Position::new(key.clone()));

        if let Some(contractual) = event.contractual_qty {
            position.contractual_qty = contractual;
        }
        if let Some(settled) = event.settled_qty {
            position.settled_qty = settled;
        }
        if let Some(ladder) = &event.ladder {
            position.sd_deliver = ladder.deliver;
            position.sd_receipt = ladder.receipt;
        }
        position.is_hypothecatable = event.is_hypothecatable;
        position.is_reserved = event.is_reserved;
        position.is_borrowed = event.is_borrowed;
        position.is_start_of_day = true;

        position.calculate_projected();
        position.mark_calculated(None, None, event.business_date);
        self.store.put_position(position.clone());
        self.stats.snapshots_absorbed += 1;
        Ok(position)
    }

    /// Load a start-of-day batch, then refresh every pending position of the
    /// date under the current derivations.
    pub fn process_start_of_day_positions(
        &mut self,
        events: Vec<PositionEvent>,
        date: BusinessDate,
    ) -> Result<Vec<Position>, CoreError> {
        for mut event in events {
            event.is_start_of_day = true;
            event.business_date = date;
            self.process_position_event(&event)?;
        }
        Ok(self.recalculate_positions(date, CalculationStatus::Pending))
    }

    // ============================================================
    // RECALCULATION
    // ============================================================

    /// Reprocess positions in `status` to rederive current/projected nets
    pub fn recalculate_positions(
        &mut self,
        date: BusinessDate,
        status: CalculationStatus,
    ) -> Vec<Position> {
        let mut updated = Vec::new();
        for mut position in self.store.positions_by_status(date, status) {
            // Pending positions with unresolved references stay pending
            if !self.refdata.knows_security(&position.key.security_id)
                || !self.refdata.knows_book(&position.key.book_id)
            {
                continue;
            }
            position.calculate_projected();
            position.mark_calculated(None, None, date);
            self.store.put_position(position.clone());
            updated.push(position);
        }
        self.stats.recalculations += 1;
        updated
    }

    /// End-of-day rollover: clone every position of `from` onto `to` with
    /// start-of-day flags. Applied-trade bookkeeping resets with the day.
    pub fn roll_positions(&mut self, from: BusinessDate, to: BusinessDate) -> Vec<Position> {
        let mut rolled = Vec::new();
        for position in self.store.positions_for_date(from) {
            let next = position.roll_to(to);
            self.store.put_position(next.clone());
            rolled.push(next);
        }
        self.applied_trades.clear();
        rolled
    }

    // ============================================================
    // INTERNALS
    // ============================================================

    /// Unknown book/security: leave a PENDING marker and surface NOT_FOUND
    /// so ingress parks the event for back-off retry.
    fn resolve_references(&mut self, key: &PositionKey) -> Result<(), CoreError> {
        let unknown_security = !self.refdata.knows_security(&key.security_id);
        let unknown_book = !self.refdata.knows_book(&key.book_id);
        if !unknown_security && !unknown_book {
            return Ok(());
        }

        if self.store.get_position(key).is_none() {
            let mut pending = Position::new(key.clone());
            pending.calculation_status = CalculationStatus::Pending;
            self.store.put_position(pending);
            self.stats.pending_created += 1;
        }

        warn!(
            book_id = %key.book_id,
            security_id = %key.security_id,
            "Unresolved reference, event parked for retry"
        );
        if unknown_security {
            Err(CoreError::UnknownSecurity(key.security_id.clone()))
        } else {
            Err(CoreError::UnknownBook(key.book_id.clone()))
        }
    }

    /// Settlement bucket for a trade: days from business date, clamped to
    /// sd0..sd4, after the JP SLAB cutoff shift.
    fn settlement_bucket(
        &self,
        event: &TradeDataEvent,
        business_date: BusinessDate,
        now: DateTime<Utc>,
    ) -> Bucket {
        let raw_offset = (event.settlement_date - business_date).num_days().max(0);

        let market = self.refdata.market_of(&event.security_id);
        let effective = if market == "JP" && event.activity_type.as_deref() == Some("SLAB") {
            let mut ctx = RuleContext::new();
            ctx.set(attrs::ACTIVITY_TYPE, "SLAB")
                .set(attrs::IS_BEFORE_JAPAN_CUTOFF, now.time() < self.jp_cutoff_utc)
                .set(attrs::EFFECTIVE_SETTLEMENT_DAY, raw_offset);
            let adjusted = RuleEngine::apply_market_specific_rule_adjustments("JP", ctx);
            adjusted
                .number(attrs::EFFECTIVE_SETTLEMENT_DAY)
                .and_then(|d| d.to_i64())
                .unwrap_or(raw_offset)
        } else {
            raw_offset
        };

        let max = (LADDER_DAYS - 1) as i64;
        Bucket {
            index: effective.min(max) as usize,
            overflowed: effective > max,
        }
    }
}

struct Bucket {
    index: usize,
    overflowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Security, SecurityStatus, SecurityType};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn refdata() -> Arc<RefData> {
        let mut rd = RefData::new();
        for (id, market) in [("AAPL", "US"), ("7203.JP", "JP"), ("2330.TW", "TW")] {
            rd.add_security(Security {
                internal_id: id.to_string(),
                security_type: SecurityType::Equity,
                market: market.to_string(),
                currency: "USD".to_string(),
                status: SecurityStatus::Active,
                is_basket_product: false,
                basket_type: None,
            });
        }
        rd.add_book("EQ-01", Some("AU-1".to_string()));
        rd.add_book("JP-01", Some("AU-2".to_string()));
        Arc::new(rd)
    }

    fn engine() -> PositionEngine {
        PositionEngine::new(
            MemoryStore::new(),
            refdata(),
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        )
    }

    fn date() -> BusinessDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn noon() -> DateTime<Utc> {
        date().and_hms_opt(12, 0, 0).unwrap().and_utc()
    }

    fn trade(id: &str, side: TradeSide, qty: i64, settle_offset: i64) -> TradeDataEvent {
        TradeDataEvent {
            trade_id: id.to_string(),
            book_id: "EQ-01".to_string(),
            security_id: "AAPL".to_string(),
            side,
            quantity: Decimal::from(qty),
            trade_date: date(),
            settlement_date: date() + chrono::Days::new(settle_offset as u64),
            counterparty_id: None,
            au_id: None,
            activity_type: None,
        }
    }

    #[test]
    fn test_buy_trade_hits_receipt_bucket() {
        let mut eng = engine();
        let p = eng
            .process_trade_event(&trade("T-1", TradeSide::Buy, 100, 2), date(), noon())
            .unwrap();

        assert_eq!(p.contractual_qty, Decimal::from(100));
        assert_eq!(p.sd_receipt[2], Decimal::from(100));
        assert_eq!(p.projected_net_position, Decimal::from(200));
        assert_eq!(p.calculation_status, CalculationStatus::Valid);
        assert_eq!(p.version, 1);
    }

    #[test]
    fn test_sell_trade_hits_deliver_bucket() {
        let mut eng = engine();
        let p = eng
            .process_trade_event(&trade("T-1", TradeSide::Sell, 40, 0), date(), noon())
            .unwrap();

        assert_eq!(p.contractual_qty, Decimal::from(-40));
        assert_eq!(p.sd_deliver[0], Decimal::from(40));
        // current = -40, projected = -40 - 40 = -80
        assert_eq!(p.projected_net_position, Decimal::from(-80));
    }

    #[test]
    fn test_long_dated_trade_clamps_into_sd4() {
        let mut eng = engine();
        let p = eng
            .process_trade_event(&trade("T-1", TradeSide::Buy, 10, 9), date(), noon())
            .unwrap();
        assert_eq!(p.sd_receipt[4], Decimal::from(10));
        assert!(p.ladder_overflow);
    }

    #[test]
    fn test_trade_replay_is_idempotent() {
        let mut eng = engine();
        let t = trade("T-1", TradeSide::Buy, 100, 1);
        let first = eng.process_trade_event(&t, date(), noon()).unwrap();
        let replay = eng.process_trade_event(&t, date(), noon()).unwrap();

        assert_eq!(first.contractual_qty, replay.contractual_qty);
        assert_eq!(first.sd_receipt, replay.sd_receipt);
        assert_eq!(eng.stats().trades_replayed, 1);
    }

    #[test]
    fn test_apply_then_reverse_round_trips() {
        let mut eng = engine();
        let baseline = eng
            .process_trade_event(&trade("T-0", TradeSide::Buy, 500, 1), date(), noon())
            .unwrap();

        eng.process_trade_event(&trade("T-1", TradeSide::Sell, 200, 1), date(), noon())
            .unwrap();
        let reversed = eng.reverse_trade_event("T-1").unwrap();

        assert_eq!(reversed.contractual_qty, baseline.contractual_qty);
        assert_eq!(reversed.sd_deliver, baseline.sd_deliver);
        assert_eq!(reversed.sd_receipt, baseline.sd_receipt);
        assert_eq!(
            reversed.projected_net_position,
            baseline.projected_net_position
        );
    }

    #[test]
    fn test_unknown_book_parks_with_pending_marker() {
        let mut eng = engine();
        let mut t = trade("T-1", TradeSide::Buy, 100, 1);
        t.book_id = "GHOST".to_string();

        let err = eng.process_trade_event(&t, date(), noon()).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(err.is_retryable());

        let key = PositionKey::new("GHOST", "AAPL", date());
        let marker = eng.get_position(&key).unwrap();
        assert_eq!(marker.calculation_status, CalculationStatus::Pending);
        assert_eq!(marker.contractual_qty, Decimal::ZERO);
    }

    #[test]
    fn test_snapshot_without_authority_is_rejected() {
        let mut eng = engine();
        let event = PositionEvent {
            event_id: "E-1".to_string(),
            book_id: "EQ-01".to_string(),
            security_id: "AAPL".to_string(),
            business_date: date(),
            contractual_qty: Some(Decimal::from(10)),
            settled_qty: Some(Decimal::from(999)),
            ladder: None,
            is_start_of_day: false,
            is_hypothecatable: false,
            is_reserved: false,
            is_borrowed: false,
        };
        let err = eng.process_position_event(&event).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn test_start_of_day_overwrites_and_recalculates() {
        let mut eng = engine();
        let event = PositionEvent {
            event_id: "E-1".to_string(),
            book_id: "EQ-01".to_string(),
            security_id: "AAPL".to_string(),
            business_date: date(),
            contractual_qty: Some(Decimal::ZERO),
            settled_qty: Some(Decimal::from(100_000)),
            ladder: None,
            is_start_of_day: true,
            is_hypothecatable: true,
            is_reserved: false,
            is_borrowed: false,
        };
        let updated = eng
            .process_start_of_day_positions(vec![event], date())
            .unwrap();
        // The snapshot itself was already VALID, so the pending sweep is empty
        assert!(updated.is_empty());

        let key = PositionKey::new("EQ-01", "AAPL", date());
        let p = eng.get_position(&key).unwrap();
        assert!(p.is_start_of_day);
        assert!(p.is_hypothecatable);
        assert_eq!(p.projected_net_position, Decimal::from(100_000));
    }

    #[test]
    fn test_jp_slab_after_cutoff_rebuckets_to_sd1() {
        let mut eng = engine();
        let mut t = trade("T-1", TradeSide::Buy, 10_000, 0);
        t.book_id = "JP-01".to_string();
        t.security_id = "7203.JP".to_string();
        t.activity_type = Some("SLAB".to_string());

        // noon UTC is past the 06:00 cutoff
        let p = eng.process_trade_event(&t, date(), noon()).unwrap();
        assert_eq!(p.sd_receipt[0], Decimal::ZERO);
        assert_eq!(p.sd_receipt[1], Decimal::from(10_000));
        // projected-net invariant still holds
        assert_eq!(
            p.projected_net_position,
            p.current_net_position + p.net_settlement()
        );
    }

    #[test]
    fn test_jp_slab_before_cutoff_stays_sd0() {
        let mut eng = engine();
        let mut t = trade("T-1", TradeSide::Buy, 10_000, 0);
        t.book_id = "JP-01".to_string();
        t.security_id = "7203.JP".to_string();
        t.activity_type = Some("SLAB".to_string());

        let early = date().and_hms_opt(4, 0, 0).unwrap().and_utc();
        let p = eng.process_trade_event(&t, date(), early).unwrap();
        assert_eq!(p.sd_receipt[0], Decimal::from(10_000));
    }

    #[test]
    fn test_non_slab_jp_trade_unaffected_by_cutoff() {
        let mut eng = engine();
        let mut t = trade("T-1", TradeSide::Buy, 500, 0);
        t.book_id = "JP-01".to_string();
        t.security_id = "7203.JP".to_string();

        let p = eng.process_trade_event(&t, date(), noon()).unwrap();
        assert_eq!(p.sd_receipt[0], Decimal::from(500));
    }

    #[test]
    fn test_rollover_clones_start_of_day() {
        let mut eng = engine();
        eng.process_trade_event(&trade("T-1", TradeSide::Buy, 100, 1), date(), noon())
            .unwrap();

        let next = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let rolled = eng.roll_positions(date(), next);
        assert_eq!(rolled.len(), 1);
        assert!(rolled[0].is_start_of_day);
        assert_eq!(rolled[0].key.business_date, next);

        // Same trade id is applicable again on the new day
        let p = eng
            .process_trade_event(&trade("T-1", TradeSide::Buy, 100, 1), next, noon())
            .unwrap();
        assert_eq!(p.contractual_qty, Decimal::from(200));
    }
}
