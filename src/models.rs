//! Domain records: securities, positions, settlement ladders
//!
//! Positions are flat records holding opaque identifiers; related entities
//! are resolved through the repository layer at query boundaries. Each engine
//! exclusively owns its entity type - cross-engine reads are value copies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{BookId, BusinessDate, Market, Qty, SecurityId, Version};

/// Settlement ladder depth: sd0..sd4
pub const LADDER_DAYS: usize = 5;

// ============================================================
// SECURITY (reference data, immutable from the core's view)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityType {
    Equity,
    Bond,
    Etf,
    Index,
    Option,
    Future,
    Swap,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityStatus {
    Active,
    Inactive,
    Delisted,
}

/// Security reference record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub internal_id: SecurityId,
    pub security_type: SecurityType,
    pub market: Market,
    pub currency: String,
    pub status: SecurityStatus,
    pub is_basket_product: bool,
    pub basket_type: Option<String>,
}

impl Security {
    pub fn is_active(&self) -> bool {
        self.status == SecurityStatus::Active
    }
}

// ============================================================
// POSITION
// ============================================================

/// Composite key owning a position: one record per (book, security, date)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub book_id: BookId,
    pub security_id: SecurityId,
    pub business_date: BusinessDate,
}

impl PositionKey {
    pub fn new(book_id: impl Into<BookId>, security_id: impl Into<SecurityId>, business_date: BusinessDate) -> Self {
        Self {
            book_id: book_id.into(),
            security_id: security_id.into(),
            business_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalculationStatus {
    Pending,
    Valid,
    Invalid,
    Error,
}

/// Per-(book, security, date) position with a 5-day settlement ladder.
///
/// Derived fields are pure functions of the stored ones:
/// - `current_net_position = settled_qty + contractual_qty`
/// - `projected_net_position = current_net + Σ(receipt − deliver)`
///
/// `calculation_status == Valid` means the derivation ran at
/// `calculation_rule_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,

    pub contractual_qty: Qty,
    pub settled_qty: Qty,

    /// Projected deliveries for sd0..sd4
    pub sd_deliver: [Qty; LADDER_DAYS],
    /// Projected receipts for sd0..sd4
    pub sd_receipt: [Qty; LADDER_DAYS],
    /// Set when a longer-dated trade was clamped into sd4
    pub ladder_overflow: bool,

    pub current_net_position: Qty,
    pub projected_net_position: Qty,

    pub is_hypothecatable: bool,
    pub is_reserved: bool,
    /// Holding originates from a borrow (drives the TW no-relend context)
    pub is_borrowed: bool,
    pub is_start_of_day: bool,

    pub calculation_status: CalculationStatus,
    pub calculation_rule_id: Option<String>,
    pub calculation_rule_version: Option<u64>,
    pub calculation_date: Option<BusinessDate>,

    pub version: Version,
    pub last_modified_at: DateTime<Utc>,
}

impl Position {
    /// Fresh empty position for a key. Starts Pending until first calculation.
    pub fn new(key: PositionKey) -> Self {
        Self {
            key,
            contractual_qty: Decimal::ZERO,
            settled_qty: Decimal::ZERO,
            sd_deliver: [Decimal::ZERO; LADDER_DAYS],
            sd_receipt: [Decimal::ZERO; LADDER_DAYS],
            ladder_overflow: false,
            current_net_position: Decimal::ZERO,
            projected_net_position: Decimal::ZERO,
            is_hypothecatable: false,
            is_reserved: false,
            is_borrowed: false,
            is_start_of_day: false,
            calculation_status: CalculationStatus::Pending,
            calculation_rule_id: None,
            calculation_rule_version: None,
            calculation_date: None,
            version: 0,
            last_modified_at: Utc::now(),
        }
    }

    /// `current_net_position := settled_qty + contractual_qty`
    pub fn calculate_current(&mut self) {
        self.current_net_position = self.settled_qty + self.contractual_qty;
    }

    /// `projected_net_position := current_net + Σ(receipt − deliver)`
    ///
    /// Calls [`calculate_current`](Self::calculate_current) first so the
    /// derivation chain never reads a stale current net.
    pub fn calculate_projected(&mut self) {
        self.calculate_current();
        self.projected_net_position = self.current_net_position + self.net_settlement();
    }

    /// `Σ(sdN_receipt − sdN_deliver)` over the 5-day grid
    pub fn net_settlement(&self) -> Qty {
        let receipts: Qty = self.sd_receipt.iter().copied().sum();
        let delivers: Qty = self.sd_deliver.iter().copied().sum();
        receipts - delivers
    }

    /// Settlement-ladder view of this position. Never mutated independently.
    pub fn settlement_ladder(&self) -> SettlementLadder {
        SettlementLadder {
            key: self.key.clone(),
            sd_deliver: self.sd_deliver,
            sd_receipt: self.sd_receipt,
            net_settlement: self.net_settlement(),
        }
    }

    /// Long holding: positive projected exposure
    pub fn is_long(&self) -> bool {
        self.projected_net_position > Decimal::ZERO
    }

    /// Short exposure of this position, zero when long or flat
    pub fn short_exposure(&self) -> Qty {
        if self.projected_net_position < Decimal::ZERO {
            -self.projected_net_position
        } else {
            Decimal::ZERO
        }
    }

    /// Saleable long quantity settling today:
    /// `settled + sd0_receipt − sd0_deliver`, floored at zero
    pub fn long_saleable_qty(&self) -> Qty {
        let qty = self.settled_qty + self.sd_receipt[0] - self.sd_deliver[0];
        qty.max(Decimal::ZERO)
    }

    /// Stamp a successful calculation: status, rule identity, date, version
    pub fn mark_calculated(
        &mut self,
        rule_id: Option<String>,
        rule_version: Option<u64>,
        date: BusinessDate,
    ) {
        self.calculation_status = CalculationStatus::Valid;
        self.calculation_rule_id = rule_id;
        self.calculation_rule_version = rule_version;
        self.calculation_date = Some(date);
        self.version += 1;
        self.last_modified_at = Utc::now();
    }

    /// Clone this position onto the next business date as start-of-day state
    pub fn roll_to(&self, next_date: BusinessDate) -> Position {
        let mut rolled = self.clone();
        rolled.key.business_date = next_date;
        rolled.is_start_of_day = true;
        rolled.calculation_status = CalculationStatus::Pending;
        rolled.version = 0;
        rolled.last_modified_at = Utc::now();
        rolled
    }
}

// ============================================================
// SETTLEMENT LADDER (query view)
// ============================================================

/// View of a position restricted to the 5-day settlement grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementLadder {
    pub key: PositionKey,
    pub sd_deliver: [Qty; LADDER_DAYS],
    pub sd_receipt: [Qty; LADDER_DAYS],
    pub net_settlement: Qty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn key() -> PositionKey {
        PositionKey::new("EQ-01", "AAPL", NaiveDate::from_ymd_opt(2024, 3, 4).unwrap())
    }

    #[test]
    fn test_current_net_is_settled_plus_contractual() {
        let mut p = Position::new(key());
        p.settled_qty = Decimal::from(100_000);
        p.contractual_qty = Decimal::from(-2_500);
        p.calculate_current();
        assert_eq!(p.current_net_position, Decimal::from(97_500));
    }

    #[test]
    fn test_projected_net_includes_ladder() {
        let mut p = Position::new(key());
        p.settled_qty = Decimal::from(1_000);
        p.sd_receipt[0] = Decimal::from(300);
        p.sd_receipt[3] = Decimal::from(200);
        p.sd_deliver[1] = Decimal::from(150);
        p.calculate_projected();
        assert_eq!(p.current_net_position, Decimal::from(1_000));
        assert_eq!(p.projected_net_position, Decimal::from(1_350));
    }

    #[test]
    fn test_ladder_view_matches_direct_computation() {
        let mut p = Position::new(key());
        p.settled_qty = Decimal::from(500);
        p.sd_receipt[2] = Decimal::from(80);
        p.sd_deliver[4] = Decimal::from(30);
        p.calculate_projected();

        let ladder = p.settlement_ladder();
        assert_eq!(ladder.net_settlement, Decimal::from(50));
        assert_eq!(
            p.projected_net_position,
            p.current_net_position + ladder.net_settlement
        );
    }

    #[test]
    fn test_long_saleable_floors_at_zero() {
        let mut p = Position::new(key());
        p.settled_qty = Decimal::from(100);
        p.sd_deliver[0] = Decimal::from(400);
        assert_eq!(p.long_saleable_qty(), Decimal::ZERO);

        p.sd_receipt[0] = Decimal::from(350);
        assert_eq!(p.long_saleable_qty(), Decimal::from(50));
    }

    #[test]
    fn test_roll_to_next_day() {
        let mut p = Position::new(key());
        p.settled_qty = Decimal::from(42);
        p.version = 7;
        let next = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let rolled = p.roll_to(next);

        assert_eq!(rolled.key.business_date, next);
        assert!(rolled.is_start_of_day);
        assert_eq!(rolled.settled_qty, Decimal::from(42));
        assert_eq!(rolled.version, 0);
        assert_eq!(rolled.calculation_status, CalculationStatus::Pending);
    }
}
