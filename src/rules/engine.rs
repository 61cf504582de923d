//! Rule Engine service
//!
//! Owns the rule book. Reads go through copy-on-write snapshots and a
//! per-(type, market) cache; writers swap the snapshot and invalidate the
//! cache explicitly. Evaluation never fails - malformed rules do not match.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::core_types::{GLOBAL_MARKET, Market};
use crate::error::CoreError;

use super::model::{CalculationRule, RuleContext, RuleType, attrs};
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Cache key for the by-type-and-market lookup
type CacheKey = (RuleType, Market);

/// Rule Engine - versioned rule store with snapshot reads
pub struct RuleEngine {
    /// The rule book. Swapped wholesale on every write.
    rules: RwLock<Arc<Vec<CalculationRule>>>,
    /// (ruleType, market) -> status-filtered, priority-sorted rules.
    /// Write-through: invalidated on create/update, no TTL.
    by_type_market: DashMap<CacheKey, Arc<Vec<CalculationRule>>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            by_type_market: DashMap::new(),
        }
    }

    pub fn with_rules(rules: Vec<CalculationRule>) -> Self {
        let engine = Self::new();
        *engine.rules.write().unwrap() = Arc::new(rules);
        engine
    }

    // ============================================================
    // QUERIES
    // ============================================================

    /// All ACTIVE rules inside their effectivity window
    pub fn get_active_rules(&self, today: NaiveDate) -> Vec<CalculationRule> {
        let snapshot = self.snapshot();
        let mut active: Vec<CalculationRule> = snapshot
            .iter()
            .filter(|r| r.is_effective(today))
            .cloned()
            .collect();
        sort_for_evaluation(&mut active);
        active
    }

    /// ACTIVE rules of a type for a market; GLOBAL rules are always included
    pub fn get_active_rules_by_type_and_market(
        &self,
        rule_type: RuleType,
        market: &str,
        today: NaiveDate,
    ) -> Vec<CalculationRule> {
        let cached = self.cached_type_market(rule_type, market);
        cached
            .iter()
            .filter(|r| r.is_effective(today))
            .cloned()
            .collect()
    }

    /// Number of rules in the book (any status)
    pub fn rule_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn get_rule(&self, id: &str) -> Option<CalculationRule> {
        self.snapshot().iter().find(|r| r.id == id).cloned()
    }

    // ============================================================
    // MUTATIONS
    // ============================================================

    /// Validate and persist a new rule; invalidates caches
    pub fn create_rule(&self, rule: CalculationRule) -> Result<CalculationRule, CoreError> {
        rule.validate()?;

        let mut guard = self.rules.write().unwrap();
        if guard.iter().any(|r| r.id == rule.id) {
            return Err(CoreError::InvalidField {
                field: "id",
                reason: format!("rule {} already exists", rule.id),
            });
        }
        let mut next = guard.as_ref().clone();
        next.push(rule.clone());
        *guard = Arc::new(next);
        drop(guard);

        self.invalidate_cache();
        info!(rule_id = %rule.id, market = %rule.market, "Rule created");
        Ok(rule)
    }

    /// Replace an existing rule; bumps `version` and invalidates caches
    pub fn update_rule(&self, mut rule: CalculationRule) -> Result<CalculationRule, CoreError> {
        rule.validate()?;

        let mut guard = self.rules.write().unwrap();
        let mut next = guard.as_ref().clone();
        let existing = next
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| CoreError::NotFound(format!("rule {}", rule.id)))?;
        rule.version = existing.version + 1;
        *existing = rule.clone();
        *guard = Arc::new(next);
        drop(guard);

        self.invalidate_cache();
        info!(rule_id = %rule.id, version = rule.version, "Rule updated");
        Ok(rule)
    }

    /// Drop every cached (type, market) entry
    pub fn invalidate_cache(&self) {
        self.by_type_market.clear();
    }

    // ============================================================
    // EVALUATION
    // ============================================================

    /// True iff (any INCLUDE matches, or there are no INCLUDE rules)
    /// AND no EXCLUDE rule matches.
    pub fn evaluate_rules(rules: &[CalculationRule], ctx: &RuleContext) -> bool {
        let mut sorted: Vec<&CalculationRule> = rules.iter().collect();
        sorted.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        let mut saw_include = false;
        let mut include_hit = false;
        for rule in &sorted {
            match rule.rule_type {
                RuleType::Include => {
                    saw_include = true;
                    if !include_hit && rule.matches(ctx) {
                        include_hit = true;
                    }
                }
                RuleType::Exclude => {
                    if rule.matches(ctx) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        include_hit || !saw_include
    }

    /// Apply market context adjustments, then evaluate the (type, market) set
    pub fn evaluate_rules_by_type_and_market(
        &self,
        rule_type: RuleType,
        market: &str,
        ctx: &RuleContext,
        today: NaiveDate,
    ) -> bool {
        let rules = self.get_active_rules_by_type_and_market(rule_type, market, today);
        let adjusted = Self::apply_market_specific_rule_adjustments(market, ctx.clone());
        let verdict = Self::evaluate_rules(&rules, &adjusted);
        debug!(
            %market,
            ?rule_type,
            rules = rules.len(),
            verdict,
            "Rule set evaluated"
        );
        verdict
    }

    /// Market-specific context adjustments, applied before evaluation.
    ///
    /// - TW: borrowed shares may not be re-lent
    /// - JP: SLAB after the domestic cutoff settles one day later;
    ///   quanto T+1 becomes T+2
    pub fn apply_market_specific_rule_adjustments(
        market: &str,
        mut ctx: RuleContext,
    ) -> RuleContext {
        match market {
            "TW" => {
                if ctx.flag(attrs::IS_BORROWED) {
                    ctx.set(attrs::CAN_BE_LENT, false);
                }
            }
            "JP" => {
                if ctx.text(attrs::ACTIVITY_TYPE) == Some("SLAB")
                    && !ctx.flag(attrs::IS_BEFORE_JAPAN_CUTOFF)
                {
                    let day = ctx
                        .number(attrs::EFFECTIVE_SETTLEMENT_DAY)
                        .unwrap_or(Decimal::ZERO);
                    ctx.set(attrs::EFFECTIVE_SETTLEMENT_DAY, day + Decimal::ONE);
                }
                if ctx.flag(attrs::IS_QUANTO)
                    && ctx.number(attrs::SETTLEMENT_DAYS) == Some(Decimal::ONE)
                {
                    ctx.set(attrs::SETTLEMENT_DAYS, Decimal::TWO);
                }
            }
            _ => {}
        }
        ctx
    }

    // ============================================================
    // INTERNALS
    // ============================================================

    fn snapshot(&self) -> Arc<Vec<CalculationRule>> {
        self.rules.read().unwrap().clone()
    }

    fn cached_type_market(&self, rule_type: RuleType, market: &str) -> Arc<Vec<CalculationRule>> {
        let key: CacheKey = (rule_type, market.to_string());
        if let Some(hit) = self.by_type_market.get(&key) {
            return hit.clone();
        }

        let snapshot = self.snapshot();
        let mut filtered: Vec<CalculationRule> = snapshot
            .iter()
            .filter(|r| r.rule_type == rule_type && (r.market == market || r.market == GLOBAL_MARKET))
            .cloned()
            .collect();
        sort_for_evaluation(&mut filtered);

        let entry = Arc::new(filtered);
        self.by_type_market.insert(key, entry.clone());
        entry
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority ascending, deterministic id order on ties
fn sort_for_evaluation(rules: &mut [CalculationRule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{RuleAction, RuleActionType, RuleCondition, RuleOperator, RuleStatus};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn rule(id: &str, rule_type: RuleType, market: &str, priority: i32) -> CalculationRule {
        CalculationRule {
            id: id.to_string(),
            name: format!("rule {id}"),
            rule_type,
            market: market.to_string(),
            priority,
            effective_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            expiry_date: None,
            status: RuleStatus::Active,
            conditions: vec![RuleCondition::new(
                attrs::IS_HYPOTHECATABLE,
                RuleOperator::Eq,
                true,
            )],
            actions: vec![RuleAction::new(RuleActionType::Include)],
            version: 1,
        }
    }

    fn hypothecatable_ctx() -> RuleContext {
        let mut c = RuleContext::new();
        c.set(attrs::IS_HYPOTHECATABLE, true);
        c
    }

    #[test]
    fn test_global_rules_always_included() {
        let engine = RuleEngine::with_rules(vec![
            rule("R-GLOBAL", RuleType::Include, "GLOBAL", 5),
            rule("R-US", RuleType::Include, "US", 10),
            rule("R-JP", RuleType::Include, "JP", 10),
        ]);

        let us = engine.get_active_rules_by_type_and_market(RuleType::Include, "US", today());
        let ids: Vec<&str> = us.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["R-GLOBAL", "R-US"]);
    }

    #[test]
    fn test_no_include_rules_means_included() {
        let ctx = hypothecatable_ctx();
        assert!(RuleEngine::evaluate_rules(&[], &ctx));

        // An EXCLUDE that matches still wins
        let exclude = rule("R-EX", RuleType::Exclude, "GLOBAL", 1);
        assert!(!RuleEngine::evaluate_rules(&[exclude], &ctx));
    }

    #[test]
    fn test_include_and_exclude_interplay() {
        let ctx = hypothecatable_ctx();
        let include = rule("R-IN", RuleType::Include, "GLOBAL", 1);
        let mut exclude = rule("R-EX", RuleType::Exclude, "GLOBAL", 2);
        // EXCLUDE matches only reserved positions
        exclude.conditions =
            vec![RuleCondition::new(attrs::IS_RESERVED, RuleOperator::Eq, true)];

        assert!(RuleEngine::evaluate_rules(
            &[include.clone(), exclude.clone()],
            &ctx
        ));

        let mut reserved = hypothecatable_ctx();
        reserved.set(attrs::IS_RESERVED, true);
        assert!(!RuleEngine::evaluate_rules(&[include, exclude], &reserved));
    }

    #[test]
    fn test_create_validates_and_update_bumps_version() {
        let engine = RuleEngine::new();
        let r = rule("R-1", RuleType::Include, "US", 1);
        engine.create_rule(r.clone()).unwrap();

        let mut missing = rule("R-2", RuleType::Include, "US", 1);
        missing.conditions.clear();
        assert_eq!(
            engine.create_rule(missing).unwrap_err().code(),
            "VALIDATION"
        );

        let updated = engine.update_rule(r).unwrap();
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn test_cache_invalidation_on_write() {
        let engine = RuleEngine::with_rules(vec![rule("R-1", RuleType::Include, "US", 1)]);
        assert_eq!(
            engine
                .get_active_rules_by_type_and_market(RuleType::Include, "US", today())
                .len(),
            1
        );

        engine
            .create_rule(rule("R-2", RuleType::Include, "US", 2))
            .unwrap();
        assert_eq!(
            engine
                .get_active_rules_by_type_and_market(RuleType::Include, "US", today())
                .len(),
            2
        );
    }

    #[test]
    fn test_tw_borrowed_cannot_be_lent() {
        let mut ctx = RuleContext::new();
        ctx.set(attrs::IS_BORROWED, true).set(attrs::CAN_BE_LENT, true);
        let adjusted = RuleEngine::apply_market_specific_rule_adjustments("TW", ctx);
        assert!(!adjusted.flag(attrs::CAN_BE_LENT));

        // Other markets leave the context alone
        let mut us = RuleContext::new();
        us.set(attrs::IS_BORROWED, true).set(attrs::CAN_BE_LENT, true);
        let adjusted = RuleEngine::apply_market_specific_rule_adjustments("US", us);
        assert!(adjusted.flag(attrs::CAN_BE_LENT));
    }

    #[test]
    fn test_jp_slab_after_cutoff_shifts_a_day() {
        let mut ctx = RuleContext::new();
        ctx.set(attrs::ACTIVITY_TYPE, "SLAB")
            .set(attrs::IS_BEFORE_JAPAN_CUTOFF, false)
            .set(attrs::EFFECTIVE_SETTLEMENT_DAY, 0i64);
        let adjusted = RuleEngine::apply_market_specific_rule_adjustments("JP", ctx);
        assert_eq!(
            adjusted.number(attrs::EFFECTIVE_SETTLEMENT_DAY),
            Some(Decimal::ONE)
        );

        // Before the cutoff nothing moves
        let mut early = RuleContext::new();
        early
            .set(attrs::ACTIVITY_TYPE, "SLAB")
            .set(attrs::IS_BEFORE_JAPAN_CUTOFF, true)
            .set(attrs::EFFECTIVE_SETTLEMENT_DAY, 0i64);
        let adjusted = RuleEngine::apply_market_specific_rule_adjustments("JP", early);
        assert_eq!(
            adjusted.number(attrs::EFFECTIVE_SETTLEMENT_DAY),
            Some(Decimal::ZERO)
        );
    }

    #[test]
    fn test_jp_quanto_settles_t_plus_two() {
        let mut ctx = RuleContext::new();
        ctx.set(attrs::IS_QUANTO, true).set(attrs::SETTLEMENT_DAYS, 1i64);
        let adjusted = RuleEngine::apply_market_specific_rule_adjustments("JP", ctx);
        assert_eq!(adjusted.number(attrs::SETTLEMENT_DAYS), Some(Decimal::TWO));

        // T+3 quanto is untouched
        let mut t3 = RuleContext::new();
        t3.set(attrs::IS_QUANTO, true).set(attrs::SETTLEMENT_DAYS, 3i64);
        let adjusted = RuleEngine::apply_market_specific_rule_adjustments("JP", t3);
        assert_eq!(
            adjusted.number(attrs::SETTLEMENT_DAYS),
            Some(Decimal::from(3))
        );
    }

    #[test]
    fn test_priority_then_id_ordering() {
        let engine = RuleEngine::with_rules(vec![
            rule("R-B", RuleType::Include, "US", 10),
            rule("R-A", RuleType::Include, "US", 10),
            rule("R-C", RuleType::Include, "US", 1),
        ]);
        let rules = engine.get_active_rules_by_type_and_market(RuleType::Include, "US", today());
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["R-C", "R-A", "R-B"]);
    }
}
