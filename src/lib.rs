//! IMS Calculation Core
//!
//! Real-time calculation core for a securities-finance inventory management
//! system: per-(book, security, date) positions with a 5-day settlement
//! ladder, six-category availability, and client/AU trading limits with
//! synchronous order validation.
//!
//! # Modules
//!
//! - [`core_types`] - Core type definitions (BookId, SecurityId, Qty, ...)
//! - [`config`] - Runtime configuration (retry, sharding, deadlines, markets)
//! - [`error`] - CoreError and the propagation-policy kinds
//! - [`models`] - Security, Position, SettlementLadder
//! - [`messages`] - Inbound event contracts and outbound change events
//! - [`refdata`] - Reference-data directory
//! - [`rules`] - Rule Engine (versioned rules, evaluation, market adjustments)
//! - [`position`] - Position Engine
//! - [`inventory`] - Inventory Engine (availability derivation)
//! - [`limits`] - Limit Engine (client/AU limits, order validation)
//! - [`repository`] - Repository traits + memory and PostgreSQL stores
//! - [`ingress`] - Shard routing, park-and-retry, dead letters
//! - [`egress`] - Outbound event publishing
//! - [`pipeline`] - Sharded multi-thread calculation pipeline
//! - [`gateway`] - Synchronous API surface (axum)

// Core types - must be first!
pub mod core_types;

// Configuration
pub mod config;

// Calculation components
pub mod egress;
pub mod error;
pub mod gateway;
pub mod ingress;
pub mod inventory;
pub mod limits;
pub mod logging;
pub mod messages;
pub mod models;
pub mod pipeline;
pub mod position;
pub mod refdata;
pub mod repository;
pub mod rules;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{AuId, BookId, BusinessDate, ClientId, Market, Qty, SecurityId};
pub use error::{CoreError, ErrorKind};
pub use inventory::{CalculationType, InventoryAvailability, InventoryEngine};
pub use limits::{AuLimit, ClientLimit, LimitEngine, OrderType};
pub use messages::{
    ContractEvent, InboundEvent, InventoryEvent, OutboundEvent, PositionEvent, TradeDataEvent,
    TradeSide,
};
pub use models::{Position, PositionKey, Security, SettlementLadder};
pub use position::PositionEngine;
pub use refdata::RefData;
pub use repository::MemoryStore;
pub use rules::{CalculationRule, RuleContext, RuleEngine};
