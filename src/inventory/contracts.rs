//! Contract book
//!
//! Absorbs financing contract events (repo, SLAB, pay-to-hold, external
//! borrow) keyed by security, and exposes the date-scoped views the
//! availability calculators read. Contracts arrive only on the event stream;
//! the engine never fetches them synchronously.

use rustc_hash::FxHashMap;

use crate::core_types::{BusinessDate, ClientId, Qty, SecurityId};
use crate::error::CoreError;
use crate::messages::{ContractEvent, ContractType};

/// One financing contract held in the book
#[derive(Debug, Clone)]
pub struct Contract {
    pub contract_id: String,
    pub contract_type: ContractType,
    pub qty: Qty,
    pub start_date: BusinessDate,
    pub end_date: BusinessDate,
    pub counterparty_id: ClientId,
}

impl Contract {
    /// Live on `date`: started and not yet matured
    pub fn is_active(&self, date: BusinessDate) -> bool {
        self.start_date <= date && date < self.end_date
    }

    /// Matured on or before `date`
    pub fn is_matured(&self, date: BusinessDate) -> bool {
        self.end_date <= date
    }
}

/// Per-security contract state for one inventory shard
#[derive(Debug, Default)]
pub struct ContractBook {
    by_security: FxHashMap<SecurityId, Vec<Contract>>,
}

impl ContractBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a contract; a re-delivered contract ID replaces the prior row
    pub fn absorb(&mut self, event: &ContractEvent) -> Result<(), CoreError> {
        event.validate()?;

        let contract = Contract {
            contract_id: event.contract_id.clone(),
            contract_type: event.contract_type,
            qty: event.qty,
            start_date: event.start_date,
            end_date: event.end_date,
            counterparty_id: event.counterparty_id.clone(),
        };

        let entry = self.by_security.entry(event.security_id.clone()).or_default();
        match entry.iter_mut().find(|c| c.contract_id == contract.contract_id) {
            Some(existing) => *existing = contract,
            None => entry.push(contract),
        }
        Ok(())
    }

    pub fn contracts_for(&self, security_id: &str) -> &[Contract] {
        self.by_security
            .get(security_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Securities with at least one contract on the book
    pub fn securities(&self) -> impl Iterator<Item = &SecurityId> {
        self.by_security.keys()
    }

    /// Sum of live contracts of a type on `date`
    pub fn active_qty(
        &self,
        security_id: &str,
        contract_type: ContractType,
        date: BusinessDate,
    ) -> Qty {
        self.contracts_for(security_id)
            .iter()
            .filter(|c| c.contract_type == contract_type && c.is_active(date))
            .map(|c| c.qty)
            .sum()
    }

    /// Sum of matured contracts of a type as of `date`
    pub fn matured_qty(
        &self,
        security_id: &str,
        contract_type: ContractType,
        date: BusinessDate,
    ) -> Qty {
        self.contracts_for(security_id)
            .iter()
            .filter(|c| c.contract_type == contract_type && c.is_matured(date))
            .map(|c| c.qty)
            .sum()
    }

    /// Live SLAB-lent quantity, excluding same-day starts when the market
    /// cutoff has passed (those settle next day and do not reduce today's
    /// lendable supply).
    pub fn slab_lent_qty(&self, security_id: &str, date: BusinessDate, after_cutoff: bool) -> Qty {
        self.contracts_for(security_id)
            .iter()
            .filter(|c| c.contract_type == ContractType::Slab && c.is_active(date))
            .filter(|c| !(after_cutoff && c.start_date == date))
            .map(|c| c.qty)
            .sum()
    }

    /// Drop matured contracts older than `keep_from` (end-of-day sweep)
    pub fn prune_matured(&mut self, keep_from: BusinessDate) {
        for contracts in self.by_security.values_mut() {
            contracts.retain(|c| c.end_date >= keep_from);
        }
        self.by_security.retain(|_, v| !v.is_empty());
    }
}
