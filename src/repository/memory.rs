//! In-memory store
//!
//! The authoritative hot state. Engines mutate their own entity types through
//! the sync API (per-key serialization comes from the shard layout, not from
//! locks here); cross-engine reads are value copies. The async repository
//! traits are implemented on top for the gateway and the persistence stage.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::core_types::{BusinessDate, Version};
use crate::error::CoreError;
use crate::inventory::model::{CalculationType, InventoryAvailability, InventoryKey};
use crate::limits::model::{AuLimit, ClientLimit, LimitKey};
use crate::models::{CalculationStatus, Position, PositionKey};

use super::{InventoryRepository, LimitRepository, PositionRepository};

/// DashMap-backed entity store
#[derive(Default)]
pub struct MemoryStore {
    positions: DashMap<PositionKey, Position>,
    inventory: DashMap<InventoryKey, InventoryAvailability>,
    client_limits: DashMap<LimitKey, ClientLimit>,
    au_limits: DashMap<LimitKey, AuLimit>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ============================================================
    // POSITIONS (sync, engine-facing)
    // ============================================================

    pub fn get_position(&self, key: &PositionKey) -> Option<Position> {
        self.positions.get(key).map(|p| p.clone())
    }

    pub fn put_position(&self, position: Position) {
        self.positions.insert(position.key.clone(), position);
    }

    pub fn positions_for_date(&self, date: BusinessDate) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|e| e.key().business_date == date)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn positions_for_security(&self, security_id: &str, date: BusinessDate) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|e| e.key().security_id == security_id && e.key().business_date == date)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn positions_by_status(
        &self,
        date: BusinessDate,
        status: CalculationStatus,
    ) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|e| e.key().business_date == date && e.value().calculation_status == status)
            .map(|e| e.value().clone())
            .collect()
    }

    // ============================================================
    // INVENTORY (sync, engine-facing)
    // ============================================================

    pub fn get_inventory(&self, key: &InventoryKey) -> Option<InventoryAvailability> {
        self.inventory.get(key).map(|r| r.clone())
    }

    pub fn put_inventory(&self, row: InventoryAvailability) {
        self.inventory.insert(row.key.clone(), row);
    }

    pub fn inventory_for_date(&self, date: BusinessDate) -> Vec<InventoryAvailability> {
        self.inventory
            .iter()
            .filter(|e| e.key().business_date == date)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn inventory_for_security(
        &self,
        security_id: &str,
        date: BusinessDate,
    ) -> Vec<InventoryAvailability> {
        self.inventory
            .iter()
            .filter(|e| e.key().security_id == security_id && e.key().business_date == date)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn inventory_by_type(
        &self,
        calculation_type: CalculationType,
        date: BusinessDate,
    ) -> Vec<InventoryAvailability> {
        self.inventory
            .iter()
            .filter(|e| {
                e.key().calculation_type == calculation_type && e.key().business_date == date
            })
            .map(|e| e.value().clone())
            .collect()
    }

    /// External availability rows feeding SHORT_SELL and LOCATE
    pub fn external_inventory_for_security(
        &self,
        security_id: &str,
        calculation_type: CalculationType,
        date: BusinessDate,
    ) -> Vec<InventoryAvailability> {
        self.inventory
            .iter()
            .filter(|e| {
                let k = e.key();
                k.is_external_source
                    && k.security_id == security_id
                    && k.calculation_type == calculation_type
                    && k.business_date == date
            })
            .map(|e| e.value().clone())
            .collect()
    }

    /// Compare-and-swap an inventory row against its `version`.
    ///
    /// The mutation runs under the map's entry lock; a stale `expected`
    /// version surfaces CONFLICT so the caller can re-read and retry once.
    pub fn cas_inventory<F>(
        &self,
        key: &InventoryKey,
        expected: Version,
        mutate: F,
    ) -> Result<InventoryAvailability, CoreError>
    where
        F: FnOnce(&mut InventoryAvailability) -> Result<(), CoreError>,
    {
        let mut entry = self
            .inventory
            .get_mut(key)
            .ok_or_else(|| CoreError::NotFound(format!("inventory {}", key.security_id)))?;

        if entry.version != expected {
            return Err(CoreError::VersionConflict {
                entity: format!("inventory {}", key.security_id),
                expected,
                found: entry.version,
            });
        }

        mutate(&mut entry)?;
        entry.version += 1;
        entry.last_modified_at = Utc::now();
        Ok(entry.clone())
    }

    // ============================================================
    // LIMITS (sync, engine-facing)
    // ============================================================

    pub fn get_client_limit(&self, key: &LimitKey) -> Option<ClientLimit> {
        self.client_limits.get(key).map(|l| l.clone())
    }

    pub fn get_au_limit(&self, key: &LimitKey) -> Option<AuLimit> {
        self.au_limits.get(key).map(|l| l.clone())
    }

    pub fn put_client_limit(&self, limit: ClientLimit) {
        self.client_limits.insert(limit.core.key.clone(), limit);
    }

    pub fn put_au_limit(&self, limit: AuLimit) {
        self.au_limits.insert(limit.core.key.clone(), limit);
    }

    pub fn client_limits_for_date(&self, date: BusinessDate) -> Vec<ClientLimit> {
        self.client_limits
            .iter()
            .filter(|e| e.key().business_date == date)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn au_limits_for_date(&self, date: BusinessDate) -> Vec<AuLimit> {
        self.au_limits
            .iter()
            .filter(|e| e.key().business_date == date)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Run `mutate` on a client limit under its entry lock.
    ///
    /// This is what serializes validation and usage updates for one
    /// (client, security) key.
    pub fn with_client_limit<F, R>(&self, key: &LimitKey, mutate: F) -> Result<R, CoreError>
    where
        F: FnOnce(&mut ClientLimit) -> Result<R, CoreError>,
    {
        let mut entry = self
            .client_limits
            .get_mut(key)
            .ok_or_else(|| CoreError::NotFound(format!("client limit {}", key.owner_id)))?;
        mutate(&mut entry)
    }

    /// Run `mutate` on an AU limit under its entry lock
    pub fn with_au_limit<F, R>(&self, key: &LimitKey, mutate: F) -> Result<R, CoreError>
    where
        F: FnOnce(&mut AuLimit) -> Result<R, CoreError>,
    {
        let mut entry = self
            .au_limits
            .get_mut(key)
            .ok_or_else(|| CoreError::NotFound(format!("AU limit {}", key.owner_id)))?;
        mutate(&mut entry)
    }

    /// Drop all limit rows for a date (explicit recalculation path)
    pub fn clear_limits_for_date(&self, date: BusinessDate) {
        self.client_limits.retain(|k, _| k.business_date != date);
        self.au_limits.retain(|k, _| k.business_date != date);
    }
}

// ============================================================================
// Async trait impls (gateway / persistence stage)
// ============================================================================

#[async_trait]
impl PositionRepository for MemoryStore {
    async fn find(&self, key: &PositionKey) -> Result<Option<Position>, CoreError> {
        Ok(self.get_position(key))
    }

    async fn find_by_business_date(&self, date: BusinessDate) -> Result<Vec<Position>, CoreError> {
        Ok(self.positions_for_date(date))
    }

    async fn find_by_security_and_date(
        &self,
        security_id: &str,
        date: BusinessDate,
    ) -> Result<Vec<Position>, CoreError> {
        Ok(self.positions_for_security(security_id, date))
    }

    async fn find_by_status(
        &self,
        date: BusinessDate,
        status: CalculationStatus,
    ) -> Result<Vec<Position>, CoreError> {
        Ok(self.positions_by_status(date, status))
    }

    async fn save(&self, position: Position) -> Result<Position, CoreError> {
        self.put_position(position.clone());
        Ok(position)
    }

    async fn save_all(&self, positions: Vec<Position>) -> Result<usize, CoreError> {
        let count = positions.len();
        for p in positions {
            self.put_position(p);
        }
        Ok(count)
    }
}

#[async_trait]
impl InventoryRepository for MemoryStore {
    async fn find(&self, key: &InventoryKey) -> Result<Option<InventoryAvailability>, CoreError> {
        Ok(self.get_inventory(key))
    }

    async fn find_by_business_date(
        &self,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        Ok(self.inventory_for_date(date))
    }

    async fn find_by_security_and_date(
        &self,
        security_id: &str,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        Ok(self.inventory_for_security(security_id, date))
    }

    async fn find_by_type_and_date(
        &self,
        calculation_type: CalculationType,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        Ok(self.inventory_by_type(calculation_type, date))
    }

    async fn find_by_market_and_date(
        &self,
        market: &str,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        Ok(self
            .inventory_for_date(date)
            .into_iter()
            .filter(|r| r.market == market)
            .collect())
    }

    async fn save(
        &self,
        availability: InventoryAvailability,
    ) -> Result<InventoryAvailability, CoreError> {
        self.put_inventory(availability.clone());
        Ok(availability)
    }

    async fn save_all(&self, rows: Vec<InventoryAvailability>) -> Result<usize, CoreError> {
        let count = rows.len();
        for r in rows {
            self.put_inventory(r);
        }
        Ok(count)
    }
}

#[async_trait]
impl LimitRepository for MemoryStore {
    async fn find_client_limit(&self, key: &LimitKey) -> Result<Option<ClientLimit>, CoreError> {
        Ok(self.get_client_limit(key))
    }

    async fn find_au_limit(&self, key: &LimitKey) -> Result<Option<AuLimit>, CoreError> {
        Ok(self.get_au_limit(key))
    }

    async fn find_client_limits_by_date(
        &self,
        date: BusinessDate,
    ) -> Result<Vec<ClientLimit>, CoreError> {
        Ok(self.client_limits_for_date(date))
    }

    async fn find_au_limits_by_date(&self, date: BusinessDate) -> Result<Vec<AuLimit>, CoreError> {
        Ok(self.au_limits_for_date(date))
    }

    async fn save_client_limit(&self, limit: ClientLimit) -> Result<ClientLimit, CoreError> {
        self.put_client_limit(limit.clone());
        Ok(limit)
    }

    async fn save_au_limit(&self, limit: AuLimit) -> Result<AuLimit, CoreError> {
        self.put_au_limit(limit.clone());
        Ok(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn date() -> BusinessDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    #[test]
    fn test_position_round_trip() {
        let store = MemoryStore::new();
        let key = PositionKey::new("EQ-01", "AAPL", date());
        let mut p = Position::new(key.clone());
        p.settled_qty = Decimal::from(100);
        store.put_position(p);

        let loaded = store.get_position(&key).unwrap();
        assert_eq!(loaded.settled_qty, Decimal::from(100));
        assert_eq!(store.positions_for_security("AAPL", date()).len(), 1);
        assert_eq!(store.positions_for_security("MSFT", date()).len(), 0);
    }

    #[test]
    fn test_cas_inventory_conflict() {
        let store = MemoryStore::new();
        let key = InventoryKey::internal("AAPL", CalculationType::Locate, date());
        let mut row = InventoryAvailability::new(key.clone(), "US");
        row.available_quantity = Decimal::from(1_000);
        row.version = 3;
        store.put_inventory(row);

        // Stale expected version is refused
        let err = store
            .cas_inventory(&key, 2, |r| {
                r.decrement_quantity += Decimal::from(10);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        // Matching version applies and bumps
        let updated = store
            .cas_inventory(&key, 3, |r| {
                r.decrement_quantity += Decimal::from(10);
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.version, 4);
        assert_eq!(updated.decrement_quantity, Decimal::from(10));
    }

    #[test]
    fn test_limit_entry_serialization_surface() {
        let store = MemoryStore::new();
        let key = LimitKey::new("C-1", "AAPL", date());
        let mut core = crate::limits::model::LimitCore::new(key.clone(), "US", "USD");
        core.short_sell_limit = Decimal::from(100);
        store.put_client_limit(ClientLimit::new(core));

        let ok = store
            .with_client_limit(&key, |l| {
                l.core
                    .consume(crate::limits::model::OrderType::ShortSell, Decimal::from(40))
            })
            .is_ok();
        assert!(ok);
        assert_eq!(
            store.get_client_limit(&key).unwrap().core.short_sell_used,
            Decimal::from(40)
        );
    }
}
