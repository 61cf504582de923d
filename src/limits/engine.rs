//! Limit Engine
//!
//! Rebuilds client and AU limits from positions plus current inventory,
//! validates orders synchronously against both levels and tracks usage.
//!
//! # Ordering
//!
//! Validation and usage updates for one (client, security) key are
//! serialized through the store's per-key entry locks. Rebuilds preserve
//! usage: a recalculation may move the limit, never the consumption.

use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::core_types::{AuId, BusinessDate, ClientId, Qty, SecurityId};
use crate::error::CoreError;
use crate::inventory::model::{CalculationType, InventoryKey};
use crate::limits::model::{
    AuLimit, ClientLimit, LimitCore, LimitKey, LimitStatus, OrderType,
};
use crate::models::Position;
use crate::refdata::RefData;
use crate::repository::MemoryStore;

/// Annotation an AU limit carries once the TW no-relend reduction applied
const TW_NO_RELEND: &str = "TW_NO_RELEND";

/// Limit engine statistics
#[derive(Debug, Default, Clone)]
pub struct LimitEngineStats {
    pub rebuilds: u64,
    pub validations: u64,
    pub approvals: u64,
    pub rejections: u64,
    pub usage_updates: u64,
}

// ============================================================
// LIMIT ENGINE
// ============================================================

pub struct LimitEngine {
    store: Arc<MemoryStore>,
    refdata: Arc<RefData>,
    stats: std::sync::Mutex<LimitEngineStats>,
}

impl LimitEngine {
    pub fn new(store: Arc<MemoryStore>, refdata: Arc<RefData>) -> Arc<Self> {
        Arc::new(Self {
            store,
            refdata,
            stats: std::sync::Mutex::new(LimitEngineStats::default()),
        })
    }

    pub fn stats(&self) -> LimitEngineStats {
        self.stats.lock().unwrap().clone()
    }

    // ============================================================
    // LIMIT DERIVATION
    // ============================================================

    /// Rebuild client and AU limits for the date from the provided positions
    /// plus current inventory. Existing usage is carried forward.
    pub fn calculate_limits(
        &self,
        positions: &[Position],
        date: BusinessDate,
    ) -> (Vec<ClientLimit>, Vec<AuLimit>) {
        // Long-sell capacity per (book, security)
        let mut book_long: FxHashMap<(&str, &SecurityId), Qty> = FxHashMap::default();
        for p in positions {
            if p.key.business_date != date {
                continue;
            }
            *book_long
                .entry((p.key.book_id.as_str(), &p.key.security_id))
                .or_insert(Decimal::ZERO) += p.long_saleable_qty();
        }

        // AU level: aggregate member books
        let mut au_rows: FxHashMap<(AuId, SecurityId), Qty> = FxHashMap::default();
        for ((book_id, security_id), long_qty) in &book_long {
            let Some(au_id) = self.refdata.au_of_book(book_id) else {
                continue;
            };
            *au_rows
                .entry((au_id.clone(), (*security_id).clone()))
                .or_insert(Decimal::ZERO) += *long_qty;
        }

        let mut au_limits = Vec::with_capacity(au_rows.len());
        for ((au_id, security_id), long_limit) in au_rows {
            let key = LimitKey::new(au_id, security_id.clone(), date);
            let mut limit = self
                .store
                .get_au_limit(&key)
                .unwrap_or_else(|| AuLimit::new(self.new_core(key, &security_id)));
            limit.core.long_sell_limit = long_limit;
            limit.core.short_sell_limit = self.short_sell_capacity(&security_id, date);
            limit.core.last_updated = Utc::now();
            self.store.put_au_limit(limit.clone());
            au_limits.push(limit);
        }

        // Client level: the client's books only
        let mut client_limits = Vec::new();
        for client_id in self.refdata.clients() {
            let books = self.refdata.books_of_client(client_id);
            let mut per_security: FxHashMap<&SecurityId, Qty> = FxHashMap::default();
            for ((book_id, security_id), long_qty) in &book_long {
                if books.iter().any(|b| b == book_id) {
                    *per_security.entry(*security_id).or_insert(Decimal::ZERO) += *long_qty;
                }
            }

            for (security_id, long_limit) in per_security {
                let key = LimitKey::new(client_id.clone(), security_id.clone(), date);
                let mut limit = self
                    .store
                    .get_client_limit(&key)
                    .unwrap_or_else(|| ClientLimit::new(self.new_core(key, security_id)));
                limit.core.long_sell_limit = long_limit;
                limit.core.short_sell_limit = self.short_sell_capacity(security_id, date);
                limit.core.last_updated = Utc::now();
                self.store.put_client_limit(limit.clone());
                client_limits.push(limit);
            }
        }

        self.stats.lock().unwrap().rebuilds += 1;
        info!(
            %date,
            clients = client_limits.len(),
            aus = au_limits.len(),
            "Limits rebuilt"
        );
        (client_limits, au_limits)
    }

    /// Same rebuild, scheduled on a background worker
    pub fn calculate_limits_async(
        self: &Arc<Self>,
        positions: Vec<Position>,
        date: BusinessDate,
    ) -> JoinHandle<(Vec<ClientLimit>, Vec<AuLimit>)> {
        let engine = Arc::clone(self);
        std::thread::spawn(move || engine.calculate_limits(&positions, date))
    }

    /// Clear-and-rebuild from today's positions (the one path allowed to
    /// lower a limit within the day). Usage survives the rebuild.
    pub fn recalculate_limits(&self, date: BusinessDate) -> (Vec<ClientLimit>, Vec<AuLimit>) {
        let positions = self.store.positions_for_date(date);

        // Capture usage, clear, rebuild, re-apply usage
        let client_usage: Vec<(LimitKey, Qty, Qty)> = self
            .store
            .client_limits_for_date(date)
            .into_iter()
            .map(|l| (l.core.key.clone(), l.core.long_sell_used, l.core.short_sell_used))
            .collect();
        let au_usage: Vec<(LimitKey, Qty, Qty)> = self
            .store
            .au_limits_for_date(date)
            .into_iter()
            .map(|l| (l.core.key.clone(), l.core.long_sell_used, l.core.short_sell_used))
            .collect();

        self.store.clear_limits_for_date(date);
        let result = self.calculate_limits(&positions, date);

        for (key, long_used, short_used) in client_usage {
            let _ = self.store.with_client_limit(&key, |l| {
                l.core.long_sell_used = long_used;
                l.core.short_sell_used = short_used;
                Ok(())
            });
        }
        for (key, long_used, short_used) in au_usage {
            let _ = self.store.with_au_limit(&key, |l| {
                l.core.long_sell_used = long_used;
                l.core.short_sell_used = short_used;
                Ok(())
            });
        }

        result
    }

    // ============================================================
    // VALIDATION & USAGE
    // ============================================================

    /// Synchronous order validation: both the client and the AU level must
    /// have headroom for `qty`. A missing limit row rejects.
    pub fn validate_order_against_limits(
        &self,
        client_id: &ClientId,
        au_id: &AuId,
        security_id: &SecurityId,
        order_type: OrderType,
        qty: Qty,
        date: BusinessDate,
    ) -> bool {
        let mut stats = self.stats.lock().unwrap();
        stats.validations += 1;
        drop(stats);

        let client_key = LimitKey::new(client_id.clone(), security_id.clone(), date);
        let au_key = LimitKey::new(au_id.clone(), security_id.clone(), date);

        let client_ok = match self.store.get_client_limit(&client_key) {
            Some(limit) => limit.has_headroom(order_type, qty),
            None => {
                warn!(%client_id, %security_id, "No client limit row, rejecting");
                false
            }
        };
        let au_ok = match self.store.get_au_limit(&au_key) {
            Some(limit) => limit.has_headroom(order_type, qty),
            None => {
                warn!(%au_id, %security_id, "No AU limit row, rejecting");
                false
            }
        };

        let verdict = client_ok && au_ok;
        let mut stats = self.stats.lock().unwrap();
        if verdict {
            stats.approvals += 1;
        } else {
            stats.rejections += 1;
        }
        debug!(%client_id, %au_id, %security_id, ?order_type, %qty, verdict, "Order validated");
        verdict
    }

    /// Atomic usage increment after a successful execution.
    ///
    /// Both levels move together: if the AU level refuses, the client
    /// consumption is rolled back and the error surfaces.
    pub fn update_limit_usage(
        &self,
        client_id: &ClientId,
        au_id: &AuId,
        security_id: &SecurityId,
        order_type: OrderType,
        qty: Qty,
        date: BusinessDate,
    ) -> Result<(), CoreError> {
        let client_key = LimitKey::new(client_id.clone(), security_id.clone(), date);
        let au_key = LimitKey::new(au_id.clone(), security_id.clone(), date);

        self.store
            .with_client_limit(&client_key, |l| l.core.consume(order_type, qty))?;

        if let Err(e) = self
            .store
            .with_au_limit(&au_key, |l| l.core.consume(order_type, qty))
        {
            // Roll the client consumption back; usage never exceeds limits
            let _ = self.store.with_client_limit(&client_key, |l| {
                match order_type {
                    OrderType::LongSell => l.core.long_sell_used -= qty,
                    OrderType::ShortSell => l.core.short_sell_used -= qty,
                }
                Ok(())
            });
            return Err(e);
        }

        self.stats.lock().unwrap().usage_updates += 1;
        Ok(())
    }

    // ============================================================
    // MARKET RULES
    // ============================================================

    /// Apply AU-level market adjustments and return the republished rows.
    ///
    /// TW: borrowed supply cannot be re-lent, so the AU short-sell limit is
    /// clamped to the security's current SHORT_SELL availability.
    pub fn apply_market_specific_rules(&self, market: &str, date: BusinessDate) -> Vec<AuLimit> {
        let mut republished = Vec::new();
        if market != "TW" {
            return republished;
        }

        for limit in self.store.au_limits_for_date(date) {
            if limit.core.market != market {
                continue;
            }
            let capacity = self.short_sell_capacity(&limit.core.key.security_id, date);
            let key = limit.core.key.clone();
            let updated = self.store.with_au_limit(&key, |l| {
                if l.core.short_sell_limit > capacity {
                    l.core.short_sell_limit = capacity;
                }
                if !l.market_specific_rules.iter().any(|r| r == TW_NO_RELEND) {
                    l.market_specific_rules.push(TW_NO_RELEND.to_string());
                }
                l.core.last_updated = Utc::now();
                Ok(l.clone())
            });
            if let Ok(row) = updated {
                republished.push(row);
            }
        }
        republished
    }

    // ============================================================
    // INTERNALS
    // ============================================================

    fn new_core(&self, key: LimitKey, security_id: &SecurityId) -> LimitCore {
        let (market, currency) = self
            .refdata
            .security(security_id)
            .map(|s| (s.market.clone(), s.currency.clone()))
            .unwrap_or_else(|| (String::new(), "USD".to_string()));
        let mut core = LimitCore::new(key, market, currency);
        core.status = LimitStatus::Active;
        core
    }

    /// Today's SHORT_SELL availability for a security (internal row)
    fn short_sell_capacity(&self, security_id: &SecurityId, date: BusinessDate) -> Qty {
        let key = InventoryKey::internal(security_id.clone(), CalculationType::ShortSell, date);
        self.store
            .get_inventory(&key)
            .map(|r| r.available_quantity)
            .unwrap_or(Decimal::ZERO)
    }
}
