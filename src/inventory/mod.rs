//! Inventory Engine - availability derivation
//!
//! Derives the six availability categories (FOR_LOAN, FOR_PLEDGE, SHORT_SELL,
//! LONG_SELL, LOCATE, OVERBORROW) from positions, contracts and external
//! availability, under Rule Engine verdicts and market adjustments.

pub mod contracts;
pub mod engine;
pub mod model;

pub use contracts::ContractBook;
pub use engine::{InventoryEngine, InventoryEngineStats};
pub use model::{CalculationType, InventoryAvailability, InventoryKey, InventoryStatus, SecurityTemperature};
