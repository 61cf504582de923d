//! Repository traits for data access abstraction
//!
//! This module provides traits that abstract data access, enabling:
//! - Testability through the in-memory implementation
//! - Flexibility to swap the backing store
//! - Clean separation between engine logic and persistence
//!
//! Writes are transactional per entity; multi-entity atomicity is NOT
//! provided - engines tolerate partial durability through idempotent
//! recomputation.

use async_trait::async_trait;

use crate::core_types::BusinessDate;
use crate::error::CoreError;
use crate::inventory::model::{CalculationType, InventoryAvailability, InventoryKey};
use crate::limits::model::{AuLimit, ClientLimit, LimitKey};
use crate::models::{CalculationStatus, Position, PositionKey};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;

// ============================================================================
// Position Repository
// ============================================================================

/// Repository trait for Position data access
#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn find(&self, key: &PositionKey) -> Result<Option<Position>, CoreError>;

    async fn find_by_business_date(&self, date: BusinessDate) -> Result<Vec<Position>, CoreError>;

    async fn find_by_security_and_date(
        &self,
        security_id: &str,
        date: BusinessDate,
    ) -> Result<Vec<Position>, CoreError>;

    async fn find_by_status(
        &self,
        date: BusinessDate,
        status: CalculationStatus,
    ) -> Result<Vec<Position>, CoreError>;

    /// Idempotent upsert; the stored row carries the caller's `version`
    async fn save(&self, position: Position) -> Result<Position, CoreError>;

    async fn save_all(&self, positions: Vec<Position>) -> Result<usize, CoreError>;
}

// ============================================================================
// Inventory Repository
// ============================================================================

/// Repository trait for InventoryAvailability data access
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    async fn find(&self, key: &InventoryKey) -> Result<Option<InventoryAvailability>, CoreError>;

    async fn find_by_business_date(
        &self,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError>;

    async fn find_by_security_and_date(
        &self,
        security_id: &str,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError>;

    async fn find_by_type_and_date(
        &self,
        calculation_type: CalculationType,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError>;

    async fn find_by_market_and_date(
        &self,
        market: &str,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError>;

    async fn save(
        &self,
        availability: InventoryAvailability,
    ) -> Result<InventoryAvailability, CoreError>;

    async fn save_all(&self, rows: Vec<InventoryAvailability>) -> Result<usize, CoreError>;
}

// ============================================================================
// Limit Repository
// ============================================================================

/// Repository trait for client and AU limit data access
#[async_trait]
pub trait LimitRepository: Send + Sync {
    async fn find_client_limit(&self, key: &LimitKey) -> Result<Option<ClientLimit>, CoreError>;

    async fn find_au_limit(&self, key: &LimitKey) -> Result<Option<AuLimit>, CoreError>;

    async fn find_client_limits_by_date(
        &self,
        date: BusinessDate,
    ) -> Result<Vec<ClientLimit>, CoreError>;

    async fn find_au_limits_by_date(&self, date: BusinessDate) -> Result<Vec<AuLimit>, CoreError>;

    async fn save_client_limit(&self, limit: ClientLimit) -> Result<ClientLimit, CoreError>;

    async fn save_au_limit(&self, limit: AuLimit) -> Result<AuLimit, CoreError>;
}
