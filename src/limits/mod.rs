//! Limit Engine - client and aggregation-unit trading limits
//!
//! Derives long-sell and short-sell limits from positions and inventory,
//! validates orders synchronously and tracks usage.

pub mod engine;
pub mod model;

pub use engine::{LimitEngine, LimitEngineStats};
pub use model::{AuLimit, ClientLimit, LimitCore, LimitKey, LimitStatus, LimitType, OrderType};
