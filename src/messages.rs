//! Messages - event contracts on both sides of the core
//!
//! Inbound events arrive on four partitioned streams; outbound change events
//! are published with partition keys guaranteeing per-key order.
//!
//! # Event Flow
//!
//! ```text
//! trades/positions ──▶ Position Engine ──▶ POSITION_UPDATE
//!                             │
//! inventories/contracts ──▶ Inventory Engine ──▶ INVENTORY_UPDATE
//!                             │
//!                         Limit Engine ──▶ CLIENT_LIMIT_UPDATE / AU_LIMIT_UPDATE
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core_types::{
    AuId, BookId, BusinessDate, ClientId, EVENT_SOURCE, Market, Qty, SecurityId,
};
use crate::error::CoreError;
use crate::inventory::model::{CalculationType, InventoryAvailability, SecurityTemperature};
use crate::limits::model::{AuLimit, ClientLimit};
use crate::models::{LADDER_DAYS, Position};

// ============================================================
// INBOUND: TRADE STREAM (partition key: bookId)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Executed trade from the booking system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDataEvent {
    pub trade_id: String,
    pub book_id: BookId,
    pub security_id: SecurityId,
    pub side: TradeSide,
    pub quantity: Qty,
    pub trade_date: BusinessDate,
    pub settlement_date: BusinessDate,
    pub counterparty_id: Option<ClientId>,
    pub au_id: Option<AuId>,
    /// Booking activity, e.g. "SLAB" for lending-against-borrow legs
    pub activity_type: Option<String>,
}

impl TradeDataEvent {
    /// Contract check: all fields except counterparty/AU are required
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.trade_id.is_empty() {
            return Err(CoreError::MissingField("tradeId"));
        }
        if self.book_id.is_empty() {
            return Err(CoreError::MissingField("bookId"));
        }
        if self.security_id.is_empty() {
            return Err(CoreError::MissingField("securityId"));
        }
        if self.quantity <= Qty::ZERO {
            return Err(CoreError::InvalidField {
                field: "quantity",
                reason: format!("must be positive, got {}", self.quantity),
            });
        }
        if self.settlement_date < self.trade_date {
            return Err(CoreError::InvalidField {
                field: "settlementDate",
                reason: "before tradeDate".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================
// INBOUND: POSITION STREAM (partition key: bookId)
// ============================================================

/// Settlement-ladder snapshot carried by external position events
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LadderSnapshot {
    pub deliver: [Qty; LADDER_DAYS],
    pub receipt: [Qty; LADDER_DAYS],
}

/// External position snapshot (start-of-day or custodian feed)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub event_id: String,
    pub book_id: BookId,
    pub security_id: SecurityId,
    pub business_date: BusinessDate,
    pub contractual_qty: Option<Qty>,
    pub settled_qty: Option<Qty>,
    pub ladder: Option<LadderSnapshot>,
    #[serde(default)]
    pub is_start_of_day: bool,
    #[serde(default)]
    pub is_hypothecatable: bool,
    #[serde(default)]
    pub is_reserved: bool,
    #[serde(default)]
    pub is_borrowed: bool,
}

impl PositionEvent {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.book_id.is_empty() {
            return Err(CoreError::MissingField("bookId"));
        }
        if self.security_id.is_empty() {
            return Err(CoreError::MissingField("securityId"));
        }
        Ok(())
    }
}

// ============================================================
// INBOUND: INVENTORY STREAM (partition key: securityId)
// ============================================================

/// External availability delta (market-data derived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEvent {
    pub event_id: String,
    pub security_identifier: SecurityId,
    pub security_market: Option<Market>,
    pub counterparty_identifier: Option<ClientId>,
    pub aggregation_unit_identifier: Option<AuId>,
    pub business_date: Option<BusinessDate>,
    pub calculation_type: Option<CalculationType>,
    pub gross_quantity: Qty,
    pub net_quantity: Qty,
    pub available_quantity: Qty,
    pub reserved_quantity: Qty,
    pub decrement_quantity: Qty,
    pub security_temperature: Option<SecurityTemperature>,
    pub borrow_rate: Option<Qty>,
    pub calculation_rule_id: Option<String>,
    pub calculation_rule_version: Option<u64>,
    #[serde(default)]
    pub is_external_source: bool,
    pub external_source_name: Option<String>,
}

impl InventoryEvent {
    /// Rejects when securityIdentifier/calculationType/businessDate missing
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.security_identifier.is_empty() {
            return Err(CoreError::MissingField("securityIdentifier"));
        }
        if self.calculation_type.is_none() {
            return Err(CoreError::MissingField("calculationType"));
        }
        if self.business_date.is_none() {
            return Err(CoreError::MissingField("businessDate"));
        }
        Ok(())
    }
}

// ============================================================
// INBOUND: CONTRACT STREAM (partition key: securityId)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractType {
    Repo,
    Slab,
    PayToHold,
    ExternalBorrow,
}

/// Financing contract lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractEvent {
    pub contract_id: String,
    #[serde(rename = "type")]
    pub contract_type: ContractType,
    pub security_id: SecurityId,
    pub qty: Qty,
    pub start_date: BusinessDate,
    pub end_date: BusinessDate,
    pub counterparty_id: ClientId,
}

impl ContractEvent {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.contract_id.is_empty() {
            return Err(CoreError::MissingField("contractId"));
        }
        if self.security_id.is_empty() {
            return Err(CoreError::MissingField("securityId"));
        }
        if self.qty < Qty::ZERO {
            return Err(CoreError::NegativeQuantity(self.contract_id.clone()));
        }
        Ok(())
    }
}

// ============================================================
// INGRESS ENVELOPE
// ============================================================

/// One event from any of the four inbound streams.
///
/// The partition key decides the shard; per-partition FIFO is preserved from
/// the bus all the way into the owning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum InboundEvent {
    Trade(TradeDataEvent),
    Position(PositionEvent),
    Inventory(InventoryEvent),
    Contract(ContractEvent),
}

impl InboundEvent {
    /// Stream partition key: trades/positions shard by book,
    /// inventories/contracts by security
    pub fn partition_key(&self) -> &str {
        match self {
            InboundEvent::Trade(e) => &e.book_id,
            InboundEvent::Position(e) => &e.book_id,
            InboundEvent::Inventory(e) => &e.security_identifier,
            InboundEvent::Contract(e) => &e.security_id,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            InboundEvent::Trade(e) => e.validate(),
            InboundEvent::Position(e) => e.validate(),
            InboundEvent::Inventory(e) => e.validate(),
            InboundEvent::Contract(e) => e.validate(),
        }
    }
}

// ============================================================
// OUTBOUND EVENTS
// ============================================================

/// Base header shared by every outbound event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_id: Uuid,
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub version: u32,
}

impl EventHeader {
    pub fn new(event_type: &str, correlation_id: Option<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            source: EVENT_SOURCE.to_string(),
            timestamp: Utc::now(),
            correlation_id,
            version: 1,
        }
    }
}

/// Published change event. Delivery is at-least-once; consumers deduplicate
/// by `header.event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundEvent {
    PositionUpdate {
        header: EventHeader,
        position: Position,
    },
    InventoryUpdate {
        header: EventHeader,
        availability: InventoryAvailability,
    },
    ClientLimitUpdate {
        header: EventHeader,
        limit: ClientLimit,
    },
    AuLimitUpdate {
        header: EventHeader,
        limit: AuLimit,
    },
}

impl OutboundEvent {
    pub fn position_update(position: Position, correlation_id: Option<String>) -> Self {
        OutboundEvent::PositionUpdate {
            header: EventHeader::new("POSITION_UPDATE", correlation_id),
            position,
        }
    }

    pub fn inventory_update(
        availability: InventoryAvailability,
        correlation_id: Option<String>,
    ) -> Self {
        OutboundEvent::InventoryUpdate {
            header: EventHeader::new("INVENTORY_UPDATE", correlation_id),
            availability,
        }
    }

    pub fn client_limit_update(limit: ClientLimit, correlation_id: Option<String>) -> Self {
        OutboundEvent::ClientLimitUpdate {
            header: EventHeader::new("CLIENT_LIMIT_UPDATE", correlation_id),
            limit,
        }
    }

    pub fn au_limit_update(limit: AuLimit, correlation_id: Option<String>) -> Self {
        OutboundEvent::AuLimitUpdate {
            header: EventHeader::new("AU_LIMIT_UPDATE", correlation_id),
            limit,
        }
    }

    pub fn header(&self) -> &EventHeader {
        match self {
            OutboundEvent::PositionUpdate { header, .. }
            | OutboundEvent::InventoryUpdate { header, .. }
            | OutboundEvent::ClientLimitUpdate { header, .. }
            | OutboundEvent::AuLimitUpdate { header, .. } => header,
        }
    }

    /// Bus partition key, per-key publish order is guaranteed downstream
    pub fn partition_key(&self) -> String {
        match self {
            OutboundEvent::PositionUpdate { position, .. } => {
                format!("{}:{}", position.key.book_id, position.key.security_id)
            }
            OutboundEvent::InventoryUpdate { availability, .. } => format!(
                "{}:{}",
                availability.key.security_id,
                availability.key.calculation_type.as_str()
            ),
            OutboundEvent::ClientLimitUpdate { limit, .. } => {
                format!("{}:{}", limit.core.key.owner_id, limit.core.key.security_id)
            }
            OutboundEvent::AuLimitUpdate { limit, .. } => {
                format!("{}:{}", limit.core.key.owner_id, limit.core.key.security_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn trade() -> TradeDataEvent {
        TradeDataEvent {
            trade_id: "T-1".to_string(),
            book_id: "EQ-01".to_string(),
            security_id: "AAPL".to_string(),
            side: TradeSide::Buy,
            quantity: Decimal::from(100),
            trade_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            settlement_date: NaiveDate::from_ymd_opt(2024, 3, 6).unwrap(),
            counterparty_id: None,
            au_id: None,
            activity_type: None,
        }
    }

    #[test]
    fn test_trade_validation() {
        assert!(trade().validate().is_ok());

        let mut bad = trade();
        bad.book_id.clear();
        assert_eq!(bad.validate().unwrap_err().code(), "VALIDATION");

        let mut bad = trade();
        bad.quantity = Decimal::ZERO;
        assert!(bad.validate().is_err());

        let mut bad = trade();
        bad.settlement_date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_partition_keys_route_by_stream() {
        let e = InboundEvent::Trade(trade());
        assert_eq!(e.partition_key(), "EQ-01");

        let c = InboundEvent::Contract(ContractEvent {
            contract_id: "C-1".to_string(),
            contract_type: ContractType::Repo,
            security_id: "MSFT".to_string(),
            qty: Decimal::from(500),
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            counterparty_id: "CP-9".to_string(),
        });
        assert_eq!(c.partition_key(), "MSFT");
    }

    #[test]
    fn test_header_is_stamped() {
        let h = EventHeader::new("POSITION_UPDATE", Some("corr-1".to_string()));
        assert_eq!(h.source, "CALCULATION_CORE");
        assert_eq!(h.event_type, "POSITION_UPDATE");
        assert_eq!(h.version, 1);
        // Every emission gets a fresh UUID
        let h2 = EventHeader::new("POSITION_UPDATE", None);
        assert_ne!(h.event_id, h2.event_id);
    }

    #[test]
    fn test_inventory_event_requires_identity() {
        let mut e = InventoryEvent {
            event_id: "E-1".to_string(),
            security_identifier: "AAPL".to_string(),
            security_market: None,
            counterparty_identifier: None,
            aggregation_unit_identifier: None,
            business_date: Some(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()),
            calculation_type: Some(CalculationType::ShortSell),
            gross_quantity: Decimal::from(10),
            net_quantity: Decimal::from(10),
            available_quantity: Decimal::from(10),
            reserved_quantity: Decimal::ZERO,
            decrement_quantity: Decimal::ZERO,
            security_temperature: None,
            borrow_rate: None,
            calculation_rule_id: None,
            calculation_rule_version: None,
            is_external_source: true,
            external_source_name: Some("EXT-LENDER".to_string()),
        };
        assert!(e.validate().is_ok());

        e.calculation_type = None;
        assert_eq!(e.validate().unwrap_err().code(), "VALIDATION");
    }
}
