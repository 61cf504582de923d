//! Trading limit records
//!
//! `ClientLimit` and `AuLimit` share a common `LimitCore` plus a kind marker;
//! behavior dispatches on the kind instead of an inheritance chain.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{BusinessDate, Market, Qty, SecurityId};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    LongSell,
    ShortSell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    /// Derived from positions/inventory by the core
    Calculated,
    /// Pinned by an operator override
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitStatus {
    Active,
    Suspended,
    Expired,
}

/// Composite key: one row per (owner, security, date)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimitKey {
    /// Client ID or aggregation-unit ID depending on the kind
    pub owner_id: String,
    pub security_id: SecurityId,
    pub business_date: BusinessDate,
}

impl LimitKey {
    pub fn new(
        owner_id: impl Into<String>,
        security_id: impl Into<SecurityId>,
        business_date: BusinessDate,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            security_id: security_id.into(),
            business_date,
        }
    }
}

/// Fields shared by both limit kinds.
///
/// Invariants: `0 ≤ used ≤ limit` per side; limits are non-decreasing within
/// a business day except on explicit recalculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCore {
    pub key: LimitKey,

    pub long_sell_limit: Qty,
    pub short_sell_limit: Qty,
    pub long_sell_used: Qty,
    pub short_sell_used: Qty,

    pub currency: String,
    pub limit_type: LimitType,
    pub market: Market,
    pub status: LimitStatus,
    pub last_updated: DateTime<Utc>,
}

impl LimitCore {
    pub fn new(key: LimitKey, market: impl Into<Market>, currency: impl Into<String>) -> Self {
        Self {
            key,
            long_sell_limit: Decimal::ZERO,
            short_sell_limit: Decimal::ZERO,
            long_sell_used: Decimal::ZERO,
            short_sell_used: Decimal::ZERO,
            currency: currency.into(),
            limit_type: LimitType::Calculated,
            market: market.into(),
            status: LimitStatus::Active,
            last_updated: Utc::now(),
        }
    }

    pub fn limit_for(&self, order_type: OrderType) -> Qty {
        match order_type {
            OrderType::LongSell => self.long_sell_limit,
            OrderType::ShortSell => self.short_sell_limit,
        }
    }

    pub fn used_for(&self, order_type: OrderType) -> Qty {
        match order_type {
            OrderType::LongSell => self.long_sell_used,
            OrderType::ShortSell => self.short_sell_used,
        }
    }

    /// Headroom check for one more order of `qty`
    pub fn has_headroom(&self, order_type: OrderType, qty: Qty) -> bool {
        self.status == LimitStatus::Active
            && self.used_for(order_type) + qty <= self.limit_for(order_type)
    }

    /// Record consumption; refuses to break `used ≤ limit`
    pub fn consume(&mut self, order_type: OrderType, qty: Qty) -> Result<(), CoreError> {
        if qty < Decimal::ZERO {
            return Err(CoreError::NegativeQuantity(self.key.owner_id.clone()));
        }
        if !self.has_headroom(order_type, qty) {
            return Err(CoreError::InvalidField {
                field: "quantity",
                reason: format!(
                    "usage {} + {} would exceed limit {}",
                    self.used_for(order_type),
                    qty,
                    self.limit_for(order_type)
                ),
            });
        }
        match order_type {
            OrderType::LongSell => self.long_sell_used += qty,
            OrderType::ShortSell => self.short_sell_used += qty,
        }
        self.last_updated = Utc::now();
        Ok(())
    }
}

/// Per-(client, security, date) limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientLimit {
    #[serde(flatten)]
    pub core: LimitCore,
}

impl ClientLimit {
    pub fn new(core: LimitCore) -> Self {
        Self { core }
    }
}

impl std::ops::Deref for ClientLimit {
    type Target = LimitCore;
    fn deref(&self) -> &LimitCore {
        &self.core
    }
}

/// Per-(aggregation-unit, security, date) limit, carrying the
/// market-specific regulatory annotations that only exist at AU level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuLimit {
    #[serde(flatten)]
    pub core: LimitCore,
    /// Regulatory annotations applied to this AU (e.g. "TW_NO_RELEND")
    pub market_specific_rules: Vec<String>,
}

impl AuLimit {
    pub fn new(core: LimitCore) -> Self {
        Self {
            core,
            market_specific_rules: Vec::new(),
        }
    }
}

impl std::ops::Deref for AuLimit {
    type Target = LimitCore;
    fn deref(&self) -> &LimitCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn core() -> LimitCore {
        let key = LimitKey::new(
            "C-123",
            "AAPL",
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
        );
        let mut c = LimitCore::new(key, "US", "USD");
        c.short_sell_limit = Decimal::from(10_000);
        c.short_sell_used = Decimal::from(6_000);
        c.long_sell_limit = Decimal::from(50_000);
        c
    }

    #[test]
    fn test_headroom() {
        let c = core();
        assert!(c.has_headroom(OrderType::ShortSell, Decimal::from(4_000)));
        assert!(!c.has_headroom(OrderType::ShortSell, Decimal::from(4_001)));
        assert!(c.has_headroom(OrderType::LongSell, Decimal::from(50_000)));
    }

    #[test]
    fn test_consume_preserves_bounds() {
        let mut c = core();
        c.consume(OrderType::ShortSell, Decimal::from(3_000)).unwrap();
        assert_eq!(c.short_sell_used, Decimal::from(9_000));

        let err = c.consume(OrderType::ShortSell, Decimal::from(2_000)).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        // usage unchanged after the refusal
        assert_eq!(c.short_sell_used, Decimal::from(9_000));
    }

    #[test]
    fn test_suspended_limit_has_no_headroom() {
        let mut c = core();
        c.status = LimitStatus::Suspended;
        assert!(!c.has_headroom(OrderType::ShortSell, Decimal::ONE));
    }
}
