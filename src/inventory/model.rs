//! Inventory availability records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{AuId, BusinessDate, ClientId, Market, Qty, SecurityId, Version};

// ============================================================
// ENUMS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalculationType {
    ForLoan,
    ForPledge,
    ShortSell,
    LongSell,
    Locate,
    Overborrow,
}

impl CalculationType {
    pub const ALL: [CalculationType; 6] = [
        CalculationType::ForLoan,
        CalculationType::ForPledge,
        CalculationType::ShortSell,
        CalculationType::LongSell,
        CalculationType::Locate,
        CalculationType::Overborrow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationType::ForLoan => "FOR_LOAN",
            CalculationType::ForPledge => "FOR_PLEDGE",
            CalculationType::ShortSell => "SHORT_SELL",
            CalculationType::LongSell => "LONG_SELL",
            CalculationType::Locate => "LOCATE",
            CalculationType::Overborrow => "OVERBORROW",
        }
    }
}

/// Borrow-market temperature of a security
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityTemperature {
    /// Hard to borrow
    Htb,
    /// General collateral
    Gc,
    Warm,
    Cold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryStatus {
    Active,
    Inactive,
    Pending,
    Error,
}

// ============================================================
// AVAILABILITY
// ============================================================

/// Composite key for one availability row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryKey {
    pub security_id: SecurityId,
    pub calculation_type: CalculationType,
    pub business_date: BusinessDate,
    pub counterparty_id: Option<ClientId>,
    pub aggregation_unit_id: Option<AuId>,
    pub is_external_source: bool,
    pub external_source_name: Option<String>,
}

impl InventoryKey {
    /// Internal (core-calculated) availability key
    pub fn internal(
        security_id: impl Into<SecurityId>,
        calculation_type: CalculationType,
        business_date: BusinessDate,
    ) -> Self {
        Self {
            security_id: security_id.into(),
            calculation_type,
            business_date,
            counterparty_id: None,
            aggregation_unit_id: None,
            is_external_source: false,
            external_source_name: None,
        }
    }

    /// Availability sourced from an external provider
    pub fn external(
        security_id: impl Into<SecurityId>,
        calculation_type: CalculationType,
        business_date: BusinessDate,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            security_id: security_id.into(),
            calculation_type,
            business_date,
            counterparty_id: None,
            aggregation_unit_id: None,
            is_external_source: true,
            external_source_name: Some(source_name.into()),
        }
    }
}

/// One availability row.
///
/// Invariant after locate application:
/// `available_quantity − decrement_quantity ≥ 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAvailability {
    pub key: InventoryKey,

    pub gross_quantity: Qty,
    pub net_quantity: Qty,
    pub available_quantity: Qty,
    pub reserved_quantity: Qty,
    /// Locate-consumed quantity
    pub decrement_quantity: Qty,

    pub market: Market,
    pub security_temperature: SecurityTemperature,
    pub borrow_rate: Option<Qty>,

    pub calculation_rule_id: Option<String>,
    pub calculation_rule_version: Option<u64>,
    pub status: InventoryStatus,

    pub version: Version,
    pub last_modified_at: DateTime<Utc>,
}

impl InventoryAvailability {
    pub fn new(key: InventoryKey, market: impl Into<Market>) -> Self {
        Self {
            key,
            gross_quantity: Decimal::ZERO,
            net_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            reserved_quantity: Decimal::ZERO,
            decrement_quantity: Decimal::ZERO,
            market: market.into(),
            security_temperature: SecurityTemperature::Gc,
            borrow_rate: None,
            calculation_rule_id: None,
            calculation_rule_version: None,
            status: InventoryStatus::Pending,
            version: 0,
            last_modified_at: Utc::now(),
        }
    }

    /// What locate consumption has left over
    pub fn remaining_quantity(&self) -> Qty {
        self.available_quantity - self.decrement_quantity
    }

    /// True when a locate of `qty` can still be absorbed
    pub fn can_decrement(&self, qty: Qty) -> bool {
        qty >= Decimal::ZERO && self.remaining_quantity() >= qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date() -> BusinessDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    #[test]
    fn test_remaining_after_decrement() {
        let key = InventoryKey::internal("AAPL", CalculationType::Locate, date());
        let mut row = InventoryAvailability::new(key, "US");
        row.available_quantity = Decimal::from(1_000);
        row.decrement_quantity = Decimal::from(400);

        assert_eq!(row.remaining_quantity(), Decimal::from(600));
        assert!(row.can_decrement(Decimal::from(600)));
        assert!(!row.can_decrement(Decimal::from(601)));
        assert!(!row.can_decrement(Decimal::from(-1)));
    }

    #[test]
    fn test_calculation_type_labels() {
        assert_eq!(CalculationType::ForLoan.as_str(), "FOR_LOAN");
        assert_eq!(CalculationType::Overborrow.as_str(), "OVERBORROW");
        assert_eq!(CalculationType::ALL.len(), 6);
    }
}
