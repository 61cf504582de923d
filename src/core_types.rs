//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Book ID - internal trading unit owning positions.
///
/// # Constraints:
/// - **Opaque**: the core never parses or derives meaning from it
/// - **Immutable**: once assigned upstream, never changes
pub type BookId = String;

/// Security internal ID - globally unique identifier for a security.
///
/// Primary partition key for inventory and contract streams.
pub type SecurityId = String;

/// Client ID - counterparty identifier for client-level limits
pub type ClientId = String;

/// Aggregation Unit ID - regulatory grouping of books for limit purposes
pub type AuId = String;

/// Market code (e.g. "US", "TW", "JP")
pub type Market = String;

/// Business date - civil date, no timezone
pub type BusinessDate = NaiveDate;

/// Quantity - fixed-point decimal.
///
/// All quantities in the core are `rust_decimal::Decimal` (28 significant
/// digits). Binary floats never enter the calculation path.
pub type Qty = Decimal;

/// Monotonic entity version for optimistic concurrency
pub type Version = u64;

/// Market scope for rules that apply everywhere
pub const GLOBAL_MARKET: &str = "GLOBAL";

/// Source field stamped on every outbound event
pub const EVENT_SOURCE: &str = "CALCULATION_CORE";
