//! Position Engine - per-(book, security, date) position state
//!
//! Owns the position records: trade application, external snapshots,
//! settlement-ladder maintenance and the current/projected net derivations.

pub mod engine;

pub use engine::{PositionEngine, PositionEngineStats};
