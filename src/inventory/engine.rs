//! Inventory Engine
//!
//! Derives the six availability categories for each (security, date) from
//! positions, contracts and external availability, under Rule Engine
//! verdicts. Categories are computed in a fixed order because later stages
//! read prior outputs:
//!
//! ```text
//! FOR_LOAN → FOR_PLEDGE → SHORT_SELL → LONG_SELL → LOCATE → OVERBORROW
//! ```
//!
//! Recomputation is idempotent: identical inputs produce identical outputs
//! modulo `version`/`last_modified_at`. Locate consumption survives
//! recomputes - the decrement is carried forward, never recomputed.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::core_types::{BusinessDate, Qty, SecurityId};
use crate::error::CoreError;
use crate::messages::{ContractEvent, ContractType, InventoryEvent};
use crate::models::{Position, Security, SecurityStatus};
use crate::refdata::RefData;
use crate::repository::MemoryStore;
use crate::rules::engine::RuleEngine;
use crate::rules::model::{CalculationRule, RuleContext, RuleType, attrs};

use super::contracts::ContractBook;
use super::model::{
    CalculationType, InventoryAvailability, InventoryKey, InventoryStatus, SecurityTemperature,
};

/// Inventory engine statistics
#[derive(Debug, Default, Clone)]
pub struct InventoryEngineStats {
    pub securities_calculated: u64,
    pub external_absorbed: u64,
    pub external_rejected: u64,
    pub contracts_absorbed: u64,
    pub locate_decrements: u64,
    pub locate_conflicts: u64,
}

// ============================================================
// INVENTORY ENGINE
// ============================================================

pub struct InventoryEngine {
    store: Arc<MemoryStore>,
    rules: Arc<RuleEngine>,
    refdata: Arc<RefData>,
    contracts: ContractBook,
    jp_cutoff_utc: NaiveTime,
    stats: InventoryEngineStats,
}

impl InventoryEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        rules: Arc<RuleEngine>,
        refdata: Arc<RefData>,
        jp_cutoff_utc: NaiveTime,
    ) -> Self {
        Self {
            store,
            rules,
            refdata,
            contracts: ContractBook::new(),
            jp_cutoff_utc,
            stats: InventoryEngineStats::default(),
        }
    }

    pub fn stats(&self) -> &InventoryEngineStats {
        &self.stats
    }

    pub fn contracts(&self) -> &ContractBook {
        &self.contracts
    }

    // ============================================================
    // EVENT ABSORPTION
    // ============================================================

    /// Absorb an external availability delta, then recompute its security
    pub fn process_inventory_event(
        &mut self,
        event: &InventoryEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        if let Err(e) = event.validate() {
            self.stats.external_rejected += 1;
            return Err(e);
        }

        let date = event
            .business_date
            .ok_or(CoreError::MissingField("businessDate"))?;
        let calculation_type = event
            .calculation_type
            .ok_or(CoreError::MissingField("calculationType"))?;

        if event.is_external_source {
            let key = InventoryKey {
                security_id: event.security_identifier.clone(),
                calculation_type,
                business_date: date,
                counterparty_id: event.counterparty_identifier.clone(),
                aggregation_unit_id: event.aggregation_unit_identifier.clone(),
                is_external_source: true,
                external_source_name: event.external_source_name.clone(),
            };
            let market = event
                .security_market
                .clone()
                .unwrap_or_else(|| self.refdata.market_of(&event.security_identifier).to_string());

            let existing_version = self.store.get_inventory(&key).map(|r| r.version).unwrap_or(0);
            let mut row = InventoryAvailability::new(key, market);
            row.gross_quantity = event.gross_quantity;
            row.net_quantity = event.net_quantity;
            row.available_quantity = event.available_quantity;
            row.reserved_quantity = event.reserved_quantity;
            row.decrement_quantity = event.decrement_quantity;
            row.security_temperature = event
                .security_temperature
                .unwrap_or(SecurityTemperature::Gc);
            row.borrow_rate = event.borrow_rate;
            row.calculation_rule_id = event.calculation_rule_id.clone();
            row.calculation_rule_version = event.calculation_rule_version;
            row.status = InventoryStatus::Active;
            row.version = existing_version + 1;
            self.store.put_inventory(row);
            self.stats.external_absorbed += 1;
        }

        self.calculate_inventory_for_security(&event.security_identifier, date, now)
    }

    /// Absorb a contract lifecycle event, then recompute its security
    pub fn process_contract_event(
        &mut self,
        event: &ContractEvent,
        date: BusinessDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        self.contracts.absorb(event)?;
        self.stats.contracts_absorbed += 1;
        self.calculate_inventory_for_security(&event.security_id, date, now)
    }

    /// A position changed: recompute availability for its security
    pub fn process_position_update(
        &mut self,
        position: &Position,
        now: DateTime<Utc>,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        self.calculate_inventory_for_security(
            &position.key.security_id,
            position.key.business_date,
            now,
        )
    }

    /// Group updated positions by security and recompute each once
    pub fn recalculate_inventory(
        &mut self,
        updated_positions: &[Position],
        date: BusinessDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let securities: FxHashSet<&SecurityId> =
            updated_positions.iter().map(|p| &p.key.security_id).collect();

        let securities: Vec<SecurityId> = securities.into_iter().cloned().collect();
        let mut out = Vec::new();
        for security_id in &securities {
            out.extend(self.calculate_inventory_for_security(security_id, date, now)?);
        }
        Ok(out)
    }

    /// Batch recompute for every security visible to this shard
    pub fn calculate_all_inventory_types(
        &mut self,
        date: BusinessDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let mut securities: FxHashSet<SecurityId> = self
            .store
            .positions_for_date(date)
            .into_iter()
            .map(|p| p.key.security_id)
            .collect();
        securities.extend(self.contracts.securities().cloned());
        for row in self.store.inventory_for_date(date) {
            securities.insert(row.key.security_id);
        }

        let mut out = Vec::new();
        for security_id in securities {
            out.extend(self.calculate_inventory_for_security(&security_id, date, now)?);
        }
        Ok(out)
    }

    // ============================================================
    // CORE DERIVATION
    // ============================================================

    /// Recompute all six categories for one security and date
    pub fn calculate_inventory_for_security(
        &mut self,
        security_id: &str,
        date: BusinessDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let security = self
            .refdata
            .security(security_id)
            .ok_or_else(|| CoreError::UnknownSecurity(security_id.to_string()))?
            .clone();

        let positions = self.store.positions_for_security(security_id, date);
        let after_cutoff = security.market == "JP" && now.time() >= self.jp_cutoff_utc;

        // An inactive security has no availability in any category
        let inactive = security.status != SecurityStatus::Active;

        let for_loan = if inactive {
            Qty::ZERO
        } else {
            self.for_loan_supply(&security, &positions, date, after_cutoff)
        };
        let for_pledge = if inactive {
            Qty::ZERO
        } else {
            self.for_pledge_supply(&security, &positions, date)
        };

        // Locate consumption is carried forward, never recomputed
        let locate_key = InventoryKey::internal(security_id, CalculationType::Locate, date);
        let carried_decrement = self
            .store
            .get_inventory(&locate_key)
            .map(|r| r.decrement_quantity)
            .unwrap_or(Decimal::ZERO);

        let (external_short, reserved_short, temperature, borrow_rate) =
            self.external_availability(security_id, CalculationType::ShortSell, date);
        let short_sell = if inactive {
            Qty::ZERO
        } else {
            (for_loan - carried_decrement + external_short - reserved_short).max(Qty::ZERO)
        };

        let long_sell = if inactive {
            Qty::ZERO
        } else {
            self.long_sell_supply(&security, &positions, date)
        };

        let (external_locate, _, _, _) =
            self.external_availability(security_id, CalculationType::Locate, date);
        let locate_available = if inactive {
            Qty::ZERO
        } else {
            (for_loan + external_locate).max(Qty::ZERO)
        };

        let overborrow = if inactive {
            Qty::ZERO
        } else {
            self.overborrow_supply(security_id, &positions, date)
        };

        let mut rows = Vec::with_capacity(CalculationType::ALL.len());
        for (calculation_type, available) in [
            (CalculationType::ForLoan, for_loan),
            (CalculationType::ForPledge, for_pledge),
            (CalculationType::ShortSell, short_sell),
            (CalculationType::LongSell, long_sell),
            (CalculationType::Locate, locate_available),
            (CalculationType::Overborrow, overborrow),
        ] {
            let key = InventoryKey::internal(security_id, calculation_type, date);
            let previous = self.store.get_inventory(&key);

            let mut row = InventoryAvailability::new(key, security.market.clone());
            row.gross_quantity = available;
            row.net_quantity = available;
            row.available_quantity = available;
            row.security_temperature = temperature;
            row.borrow_rate = borrow_rate;
            if calculation_type == CalculationType::Locate {
                row.decrement_quantity = carried_decrement;
                // Locate supply already net of prior consumption stays lawful
                if row.available_quantity < row.decrement_quantity {
                    row.available_quantity = row.decrement_quantity;
                }
            }
            let (rule_id, rule_version) = self.rule_stamp(calculation_type, &security.market, date);
            row.calculation_rule_id = rule_id;
            row.calculation_rule_version = rule_version;
            row.status = InventoryStatus::Active;
            row.version = previous.map(|p| p.version).unwrap_or(0) + 1;

            self.store.put_inventory(row.clone());
            rows.push(row);
        }

        self.stats.securities_calculated += 1;
        debug!(
            security_id,
            %date,
            for_loan = %for_loan,
            short_sell = %short_sell,
            "Inventory recalculated"
        );
        Ok(rows)
    }

    // ============================================================
    // LOCATE CONSUMPTION
    // ============================================================

    /// Consume locate supply with compare-and-swap on the row version.
    /// One local retry on a concurrent bump, then CONFLICT surfaces.
    pub fn apply_locate_decrement(
        &mut self,
        security_id: &str,
        date: BusinessDate,
        qty: Qty,
    ) -> Result<InventoryAvailability, CoreError> {
        if qty <= Qty::ZERO {
            return Err(CoreError::NegativeQuantity(security_id.to_string()));
        }
        let key = InventoryKey::internal(security_id, CalculationType::Locate, date);

        for attempt in 0..2 {
            let current = self
                .store
                .get_inventory(&key)
                .ok_or_else(|| CoreError::NotFound(format!("locate {security_id}")))?;

            if !current.can_decrement(qty) {
                return Err(CoreError::InvalidField {
                    field: "quantity",
                    reason: format!(
                        "locate demand {qty} exceeds remaining {}",
                        current.remaining_quantity()
                    ),
                });
            }

            match self.store.cas_inventory(&key, current.version, |row| {
                row.decrement_quantity += qty;
                Ok(())
            }) {
                Ok(updated) => {
                    self.stats.locate_decrements += 1;
                    return Ok(updated);
                }
                Err(e) if e.kind() == crate::error::ErrorKind::Conflict => {
                    self.stats.locate_conflicts += 1;
                    if attempt == 0 {
                        continue;
                    }
                    // One local retry spent; the caller sees a contract
                    // violation, not a transient conflict
                    return Err(CoreError::InvalidField {
                        field: "version",
                        reason: format!("locate row for {security_id} kept moving under retry"),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("second CAS attempt either returns or errors")
    }

    // ============================================================
    // CATEGORY CALCULATORS
    // ============================================================

    /// FOR_LOAN: hypothecatable longs plus matured repo releases, minus
    /// SLAB-lent, live repo pledges and pay-to-hold reserves.
    fn for_loan_supply(
        &self,
        security: &Security,
        positions: &[Position],
        date: BusinessDate,
        after_cutoff: bool,
    ) -> Qty {
        let rules = self.category_rules(CalculationType::ForLoan, &security.market, date);

        let mut supply = Qty::ZERO;
        for position in positions {
            let ctx = self.position_context(security, position);
            let adjusted =
                RuleEngine::apply_market_specific_rule_adjustments(&security.market, ctx);
            if !adjusted.flag(attrs::CAN_BE_LENT) {
                continue;
            }
            if !RuleEngine::evaluate_rules(&rules, &adjusted) {
                continue;
            }
            if position.is_hypothecatable && position.is_long() {
                supply += position.projected_net_position;
            }
        }

        supply += self
            .contracts
            .matured_qty(&security.internal_id, ContractType::Repo, date);
        supply -= self
            .contracts
            .slab_lent_qty(&security.internal_id, date, after_cutoff);
        supply -= self
            .contracts
            .active_qty(&security.internal_id, ContractType::Repo, date);
        supply -= self
            .contracts
            .active_qty(&security.internal_id, ContractType::PayToHold, date);

        supply.max(Qty::ZERO)
    }

    /// FOR_PLEDGE: non-reserved, non-already-pledged longs
    fn for_pledge_supply(
        &self,
        security: &Security,
        positions: &[Position],
        date: BusinessDate,
    ) -> Qty {
        let rules = self.category_rules(CalculationType::ForPledge, &security.market, date);

        let mut supply = Qty::ZERO;
        for position in positions {
            if position.is_reserved || !position.is_long() {
                continue;
            }
            let ctx = self.position_context(security, position);
            let adjusted =
                RuleEngine::apply_market_specific_rule_adjustments(&security.market, ctx);
            if !RuleEngine::evaluate_rules(&rules, &adjusted) {
                continue;
            }
            supply += position.projected_net_position;
        }

        // Collateral already out under live repo is not pledgeable again
        supply -= self
            .contracts
            .active_qty(&security.internal_id, ContractType::Repo, date);

        supply.max(Qty::ZERO)
    }

    /// LONG_SELL: today-settling saleable longs; contracts are ignored
    fn long_sell_supply(
        &self,
        security: &Security,
        positions: &[Position],
        date: BusinessDate,
    ) -> Qty {
        let rules = self.category_rules(CalculationType::LongSell, &security.market, date);

        let mut supply = Qty::ZERO;
        for position in positions {
            let ctx = self.position_context(security, position);
            let adjusted =
                RuleEngine::apply_market_specific_rule_adjustments(&security.market, ctx);
            if !RuleEngine::evaluate_rules(&rules, &adjusted) {
                continue;
            }
            supply += position.long_saleable_qty();
        }
        supply
    }

    /// OVERBORROW: borrow supply beyond short-cover demand. Pay-to-hold
    /// capacity never counts toward the overborrowed quantity.
    fn overborrow_supply(
        &self,
        security_id: &str,
        positions: &[Position],
        date: BusinessDate,
    ) -> Qty {
        let borrowed = self
            .contracts
            .active_qty(security_id, ContractType::ExternalBorrow, date);
        if borrowed == Qty::ZERO {
            return Qty::ZERO;
        }

        let pay_to_hold = self
            .contracts
            .active_qty(security_id, ContractType::PayToHold, date);
        let required_to_cover: Qty = positions.iter().map(|p| p.short_exposure()).sum();

        (borrowed - pay_to_hold - required_to_cover).max(Qty::ZERO)
    }

    // ============================================================
    // INTERNALS
    // ============================================================

    fn position_context(&self, security: &Security, position: &Position) -> RuleContext {
        let mut ctx = RuleContext::new();
        ctx.set(attrs::MARKET, security.market.as_str())
            .set(
                attrs::SECURITY_STATUS,
                match security.status {
                    SecurityStatus::Active => "ACTIVE",
                    SecurityStatus::Inactive => "INACTIVE",
                    SecurityStatus::Delisted => "DELISTED",
                },
            )
            .set(attrs::IS_HYPOTHECATABLE, position.is_hypothecatable)
            .set(attrs::IS_RESERVED, position.is_reserved)
            .set(attrs::IS_BORROWED, position.is_borrowed)
            .set(attrs::CAN_BE_LENT, true)
            .set(attrs::PROJECTED_NET, position.projected_net_position)
            .set(attrs::CURRENT_NET, position.current_net_position);
        ctx
    }

    fn category_rules(
        &self,
        calculation_type: CalculationType,
        market: &str,
        date: BusinessDate,
    ) -> Vec<CalculationRule> {
        // INCLUDE and EXCLUDE sets both apply to a category evaluation
        let mut rules = self
            .rules
            .get_active_rules_by_type_and_market(RuleType::Include, market, date);
        rules.extend(
            self.rules
                .get_active_rules_by_type_and_market(RuleType::Exclude, market, date),
        );
        rules.retain(|r| rule_targets_category(r, calculation_type));
        rules
    }

    fn rule_stamp(
        &self,
        calculation_type: CalculationType,
        market: &str,
        date: BusinessDate,
    ) -> (Option<String>, Option<u64>) {
        self.category_rules(calculation_type, market, date)
            .first()
            .map(|r| (Some(r.id.clone()), Some(r.version)))
            .unwrap_or((None, None))
    }

    /// External rows feeding a category: (available, reserved, temperature, rate)
    fn external_availability(
        &self,
        security_id: &str,
        calculation_type: CalculationType,
        date: BusinessDate,
    ) -> (Qty, Qty, SecurityTemperature, Option<Qty>) {
        let rows =
            self.store
                .external_inventory_for_security(security_id, calculation_type, date);

        let mut available = Qty::ZERO;
        let mut reserved = Qty::ZERO;
        let mut temperature = SecurityTemperature::Gc;
        let mut borrow_rate = None;
        for row in &rows {
            if row.status != InventoryStatus::Active {
                warn!(security_id, source = ?row.key.external_source_name, "Skipping non-active external row");
                continue;
            }
            available += row.available_quantity;
            reserved += row.reserved_quantity;
            if row.security_temperature == SecurityTemperature::Htb {
                temperature = SecurityTemperature::Htb;
            }
            if borrow_rate.is_none() {
                borrow_rate = row.borrow_rate;
            }
        }
        (available, reserved, temperature, borrow_rate)
    }
}

/// A rule names its target categories through an INCLUDE/EXCLUDE action
/// parameter; a rule without one applies to every category.
fn rule_targets_category(rule: &CalculationRule, calculation_type: CalculationType) -> bool {
    let mut saw_target = false;
    for action in &rule.actions {
        if let Some(target) = action.parameters.get("calculationType") {
            saw_target = true;
            if target.as_text() == Some(calculation_type.as_str()) {
                return true;
            }
        }
    }
    !saw_target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionKey, SecurityType};
    use crate::rules::model::{RuleAction, RuleActionType, RuleCondition, RuleOperator, RuleStatus};
    use chrono::NaiveDate;

    fn date() -> BusinessDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn noon() -> DateTime<Utc> {
        date().and_hms_opt(12, 0, 0).unwrap().and_utc()
    }

    fn security(id: &str, market: &str, status: SecurityStatus) -> Security {
        Security {
            internal_id: id.to_string(),
            security_type: SecurityType::Equity,
            market: market.to_string(),
            currency: "USD".to_string(),
            status,
            is_basket_product: false,
            basket_type: None,
        }
    }

    fn refdata() -> Arc<RefData> {
        let mut rd = RefData::new();
        rd.add_security(security("AAPL", "US", SecurityStatus::Active));
        rd.add_security(security("MSFT", "US", SecurityStatus::Active));
        rd.add_security(security("2330.TW", "TW", SecurityStatus::Active));
        rd.add_security(security("DEAD", "US", SecurityStatus::Inactive));
        rd.add_book("EQ-01", Some("AU-1".to_string()));
        rd.add_book("TW-01", Some("AU-2".to_string()));
        Arc::new(rd)
    }

    fn hypothecatable_long_rule() -> CalculationRule {
        CalculationRule {
            id: "HYPOTHECATABLE_LONG".to_string(),
            name: "hypothecatable long".to_string(),
            rule_type: RuleType::Include,
            market: "GLOBAL".to_string(),
            priority: 1,
            effective_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            expiry_date: None,
            status: RuleStatus::Active,
            conditions: vec![
                RuleCondition::new(attrs::IS_HYPOTHECATABLE, RuleOperator::Eq, true),
                RuleCondition::new(attrs::PROJECTED_NET, RuleOperator::Gt, Decimal::ZERO),
            ],
            actions: vec![RuleAction::new(RuleActionType::Include)],
            version: 1,
        }
    }

    fn engine_with_rules(rules: Vec<CalculationRule>) -> InventoryEngine {
        InventoryEngine::new(
            MemoryStore::new(),
            Arc::new(RuleEngine::with_rules(rules)),
            refdata(),
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        )
    }

    fn long_position(book: &str, security: &str, settled: i64) -> Position {
        let mut p = Position::new(PositionKey::new(book, security, date()));
        p.settled_qty = Decimal::from(settled);
        p.is_hypothecatable = true;
        p.calculate_projected();
        p
    }

    fn get(rows: &[InventoryAvailability], t: CalculationType) -> &InventoryAvailability {
        rows.iter().find(|r| r.key.calculation_type == t).unwrap()
    }

    #[test]
    fn test_for_loan_baseline() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);
        eng.store.put_position(long_position("EQ-01", "AAPL", 100_000));

        let rows = eng
            .calculate_inventory_for_security("AAPL", date(), noon())
            .unwrap();

        assert_eq!(
            get(&rows, CalculationType::ForLoan).available_quantity,
            Decimal::from(100_000)
        );
        assert_eq!(
            get(&rows, CalculationType::ForPledge).available_quantity,
            Decimal::from(100_000)
        );
        assert!(
            get(&rows, CalculationType::ShortSell).available_quantity >= Decimal::from(100_000)
        );
        assert_eq!(
            get(&rows, CalculationType::LongSell).available_quantity,
            Decimal::from(100_000)
        );
        for row in &rows {
            assert_eq!(row.status, InventoryStatus::Active);
            assert_eq!(
                row.calculation_rule_id.as_deref(),
                Some("HYPOTHECATABLE_LONG")
            );
        }
    }

    #[test]
    fn test_tw_borrowed_long_contributes_zero_for_loan() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);
        let mut p = long_position("TW-01", "2330.TW", 50_000);
        p.is_borrowed = true;
        p.calculate_projected();
        eng.store.put_position(p);

        let rows = eng
            .calculate_inventory_for_security("2330.TW", date(), noon())
            .unwrap();

        assert_eq!(
            get(&rows, CalculationType::ForLoan).available_quantity,
            Decimal::ZERO
        );
        // LONG_SELL is unaffected by the no-relend rule
        assert_eq!(
            get(&rows, CalculationType::LongSell).available_quantity,
            Decimal::from(50_000)
        );
    }

    #[test]
    fn test_inactive_security_has_zero_availability() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);
        eng.store.put_position(long_position("EQ-01", "DEAD", 10_000));

        let rows = eng
            .calculate_inventory_for_security("DEAD", date(), noon())
            .unwrap();
        for row in &rows {
            assert_eq!(row.available_quantity, Decimal::ZERO);
        }
    }

    #[test]
    fn test_contracts_shape_for_loan() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);
        eng.store.put_position(long_position("EQ-01", "AAPL", 100_000));

        // Live repo pledge of 20k and a matured repo release of 5k
        let live_repo = ContractEvent {
            contract_id: "R-1".to_string(),
            contract_type: ContractType::Repo,
            security_id: "AAPL".to_string(),
            qty: Decimal::from(20_000),
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            counterparty_id: "CP-1".to_string(),
        };
        let matured_repo = ContractEvent {
            contract_id: "R-2".to_string(),
            contract_type: ContractType::Repo,
            security_id: "AAPL".to_string(),
            qty: Decimal::from(5_000),
            start_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            counterparty_id: "CP-1".to_string(),
        };
        eng.process_contract_event(&live_repo, date(), noon()).unwrap();
        let rows = eng
            .process_contract_event(&matured_repo, date(), noon())
            .unwrap();

        // 100000 + 5000 released - 20000 pledged
        assert_eq!(
            get(&rows, CalculationType::ForLoan).available_quantity,
            Decimal::from(85_000)
        );
    }

    #[test]
    fn test_overborrow_excludes_pay_to_hold() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);

        // Short exposure of 30k on MSFT
        let mut short = Position::new(PositionKey::new("EQ-01", "MSFT", date()));
        short.settled_qty = Decimal::from(-30_000);
        short.calculate_projected();
        eng.store.put_position(short);

        let borrow = ContractEvent {
            contract_id: "B-1".to_string(),
            contract_type: ContractType::ExternalBorrow,
            security_id: "MSFT".to_string(),
            qty: Decimal::from(80_000),
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 29).unwrap(),
            counterparty_id: "CP-1".to_string(),
        };
        let pay_to_hold = ContractEvent {
            contract_id: "P-1".to_string(),
            contract_type: ContractType::PayToHold,
            security_id: "MSFT".to_string(),
            qty: Decimal::from(20_000),
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 29).unwrap(),
            counterparty_id: "CP-2".to_string(),
        };
        eng.process_contract_event(&borrow, date(), noon()).unwrap();
        let rows = eng
            .process_contract_event(&pay_to_hold, date(), noon())
            .unwrap();

        // 80000 - 20000 pay-to-hold - 30000 short cover
        assert_eq!(
            get(&rows, CalculationType::Overborrow).available_quantity,
            Decimal::from(30_000)
        );
    }

    #[test]
    fn test_external_availability_feeds_short_sell() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);
        eng.store.put_position(long_position("EQ-01", "AAPL", 100_000));

        let event = InventoryEvent {
            event_id: "E-1".to_string(),
            security_identifier: "AAPL".to_string(),
            security_market: Some("US".to_string()),
            counterparty_identifier: None,
            aggregation_unit_identifier: None,
            business_date: Some(date()),
            calculation_type: Some(CalculationType::ShortSell),
            gross_quantity: Decimal::from(40_000),
            net_quantity: Decimal::from(40_000),
            available_quantity: Decimal::from(40_000),
            reserved_quantity: Decimal::from(10_000),
            decrement_quantity: Decimal::ZERO,
            security_temperature: Some(SecurityTemperature::Htb),
            borrow_rate: Some(Decimal::new(25, 1)),
            calculation_rule_id: None,
            calculation_rule_version: None,
            is_external_source: true,
            external_source_name: Some("EXT-LENDER".to_string()),
        };
        let rows = eng.process_inventory_event(&event, noon()).unwrap();

        // 100000 internal + 40000 external - 10000 reserved
        let short = get(&rows, CalculationType::ShortSell);
        assert_eq!(short.available_quantity, Decimal::from(130_000));
        assert_eq!(short.security_temperature, SecurityTemperature::Htb);
    }

    #[test]
    fn test_locate_decrement_cas_and_carry() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);
        eng.store.put_position(long_position("EQ-01", "AAPL", 100_000));
        eng.calculate_inventory_for_security("AAPL", date(), noon())
            .unwrap();

        let updated = eng
            .apply_locate_decrement("AAPL", date(), Decimal::from(30_000))
            .unwrap();
        assert_eq!(updated.remaining_quantity(), Decimal::from(70_000));

        // Recompute keeps the consumption
        let rows = eng
            .calculate_inventory_for_security("AAPL", date(), noon())
            .unwrap();
        let locate = get(&rows, CalculationType::Locate);
        assert_eq!(locate.decrement_quantity, Decimal::from(30_000));
        assert!(locate.remaining_quantity() >= Decimal::ZERO);

        // Over-consumption is refused
        let err = eng
            .apply_locate_decrement("AAPL", date(), Decimal::from(80_000))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut eng = engine_with_rules(vec![hypothecatable_long_rule()]);
        eng.store.put_position(long_position("EQ-01", "AAPL", 100_000));

        let first = eng
            .calculate_inventory_for_security("AAPL", date(), noon())
            .unwrap();
        let second = eng
            .calculate_inventory_for_security("AAPL", date(), noon())
            .unwrap();

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.key, b.key);
            assert_eq!(a.available_quantity, b.available_quantity);
            assert_eq!(a.gross_quantity, b.gross_quantity);
            assert_eq!(a.reserved_quantity, b.reserved_quantity);
        }
    }

    #[test]
    fn test_missing_identity_rejected() {
        let mut eng = engine_with_rules(vec![]);
        let mut event = InventoryEvent {
            event_id: "E-1".to_string(),
            security_identifier: "AAPL".to_string(),
            security_market: None,
            counterparty_identifier: None,
            aggregation_unit_identifier: None,
            business_date: None,
            calculation_type: Some(CalculationType::ShortSell),
            gross_quantity: Decimal::ZERO,
            net_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            reserved_quantity: Decimal::ZERO,
            decrement_quantity: Decimal::ZERO,
            security_temperature: None,
            borrow_rate: None,
            calculation_rule_id: None,
            calculation_rule_version: None,
            is_external_source: true,
            external_source_name: None,
        };
        assert_eq!(
            eng.process_inventory_event(&event, noon()).unwrap_err().code(),
            "VALIDATION"
        );
        event.business_date = Some(date());
        event.calculation_type = None;
        assert_eq!(
            eng.process_inventory_event(&event, noon()).unwrap_err().code(),
            "VALIDATION"
        );
    }
}
