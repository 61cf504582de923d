//! Rule model: rules, conditions, actions and the attribute context
//!
//! A rule matches when its condition chain holds against a context. The chain
//! is evaluated left-to-right with AND binding tighter than OR. Malformed
//! conditions never fail evaluation - they simply do not match.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::{BusinessDate, Market};
use crate::error::CoreError;

// ============================================================
// ENUMS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Include,
    Exclude,
    Adjust,
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Active,
    Inactive,
    Draft,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleOperator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleActionType {
    Include,
    Exclude,
    AdjustQuantity,
    SetFlag,
    ApplyFactor,
    Validate,
    Notify,
}

// ============================================================
// ATTRIBUTE VALUES & CONTEXT
// ============================================================

/// Typed attribute value used in both contexts and rule conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Flag(bool),
    Number(Decimal),
    Text(String),
    List(Vec<AttrValue>),
}

impl AttrValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            AttrValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            AttrValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Flag(v)
    }
}

impl From<Decimal> for AttrValue {
    fn from(v: Decimal) -> Self {
        AttrValue::Number(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Number(Decimal::from(v))
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// Well-known attribute names used by the engines when building contexts
pub mod attrs {
    pub const MARKET: &str = "market";
    pub const SECURITY_STATUS: &str = "securityStatus";
    pub const SECURITY_TYPE: &str = "securityType";
    pub const IS_HYPOTHECATABLE: &str = "isHypothecatable";
    pub const IS_RESERVED: &str = "isReserved";
    pub const IS_BORROWED: &str = "isBorrowed";
    pub const CAN_BE_LENT: &str = "canBeLent";
    pub const ACTIVITY_TYPE: &str = "activityType";
    pub const IS_BEFORE_JAPAN_CUTOFF: &str = "isBeforeJapanCutoff";
    pub const EFFECTIVE_SETTLEMENT_DAY: &str = "effectiveSettlementDay";
    pub const SETTLEMENT_DAYS: &str = "settlementDays";
    pub const IS_QUANTO: &str = "isQuanto";
    pub const PROJECTED_NET: &str = "projectedNetPosition";
    pub const CURRENT_NET: &str = "currentNetPosition";
}

/// Attribute context a rule set is evaluated against.
///
/// Built fresh per evaluation from an engine-owned snapshot; market
/// adjustments mutate the context, never the underlying entities.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    attributes: FxHashMap<String, AttrValue>,
}

impl RuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, attribute: &str, value: impl Into<AttrValue>) -> &mut Self {
        self.attributes.insert(attribute.to_string(), value.into());
        self
    }

    pub fn get(&self, attribute: &str) -> Option<&AttrValue> {
        self.attributes.get(attribute)
    }

    pub fn flag(&self, attribute: &str) -> bool {
        self.get(attribute).and_then(AttrValue::as_flag).unwrap_or(false)
    }

    pub fn number(&self, attribute: &str) -> Option<Decimal> {
        self.get(attribute).and_then(AttrValue::as_number)
    }

    pub fn text(&self, attribute: &str) -> Option<&str> {
        self.get(attribute).and_then(AttrValue::as_text)
    }
}

// ============================================================
// CONDITIONS
// ============================================================

/// Single predicate in a rule's condition chain.
///
/// `logical_operator` joins this condition to the NEXT one; the last
/// condition's operator is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub attribute: String,
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: Option<AttrValue>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
}

impl RuleCondition {
    pub fn new(attribute: &str, operator: RuleOperator, value: impl Into<AttrValue>) -> Self {
        Self {
            attribute: attribute.to_string(),
            operator,
            value: Some(value.into()),
            logical_operator: LogicalOperator::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.logical_operator = LogicalOperator::Or;
        self
    }

    /// Closed-world evaluation: an absent attribute matches only IS_NULL;
    /// a type mismatch or missing comparison value never matches.
    pub fn evaluate(&self, ctx: &RuleContext) -> bool {
        let actual = ctx.get(&self.attribute);

        match self.operator {
            RuleOperator::IsNull => return actual.is_none(),
            RuleOperator::IsNotNull => return actual.is_some(),
            _ => {}
        }

        let (Some(actual), Some(expected)) = (actual, self.value.as_ref()) else {
            return false;
        };

        match self.operator {
            RuleOperator::Eq => actual == expected,
            RuleOperator::Neq => actual != expected,
            RuleOperator::Gt | RuleOperator::Lt | RuleOperator::Gte | RuleOperator::Lte => {
                let (Some(a), Some(b)) = (actual.as_number(), expected.as_number()) else {
                    return false;
                };
                match self.operator {
                    RuleOperator::Gt => a > b,
                    RuleOperator::Lt => a < b,
                    RuleOperator::Gte => a >= b,
                    RuleOperator::Lte => a <= b,
                    _ => unreachable!(),
                }
            }
            RuleOperator::Contains => match (actual.as_text(), expected.as_text()) {
                (Some(a), Some(b)) => a.contains(b),
                _ => false,
            },
            RuleOperator::StartsWith => match (actual.as_text(), expected.as_text()) {
                (Some(a), Some(b)) => a.starts_with(b),
                _ => false,
            },
            RuleOperator::EndsWith => match (actual.as_text(), expected.as_text()) {
                (Some(a), Some(b)) => a.ends_with(b),
                _ => false,
            },
            RuleOperator::In => match expected {
                AttrValue::List(items) => items.contains(actual),
                _ => false,
            },
            RuleOperator::NotIn => match expected {
                AttrValue::List(items) => !items.contains(actual),
                _ => false,
            },
            RuleOperator::IsNull | RuleOperator::IsNotNull => unreachable!(),
        }
    }
}

// ============================================================
// ACTIONS
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    pub action_type: RuleActionType,
    #[serde(default)]
    pub parameters: BTreeMap<String, AttrValue>,
}

impl RuleAction {
    pub fn new(action_type: RuleActionType) -> Self {
        Self {
            action_type,
            parameters: BTreeMap::new(),
        }
    }
}

// ============================================================
// RULES
// ============================================================

/// Versioned calculation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationRule {
    pub id: String,
    pub name: String,
    pub rule_type: RuleType,
    /// Market code or "GLOBAL"
    pub market: Market,
    pub priority: i32,
    pub effective_date: BusinessDate,
    pub expiry_date: Option<BusinessDate>,
    pub status: RuleStatus,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub version: u64,
}

impl CalculationRule {
    /// Active and inside the [effective, expiry) window
    pub fn is_effective(&self, today: NaiveDate) -> bool {
        self.status == RuleStatus::Active
            && self.effective_date <= today
            && self.expiry_date.map(|d| today < d).unwrap_or(true)
    }

    /// Evaluate the condition chain: left-to-right, AND binds tighter than OR
    pub fn matches(&self, ctx: &RuleContext) -> bool {
        if self.conditions.is_empty() {
            return false;
        }

        let mut any_group = false;
        let mut current = true;
        for cond in &self.conditions {
            current = current && cond.evaluate(ctx);
            if cond.logical_operator == LogicalOperator::Or {
                any_group = any_group || current;
                current = true;
            }
        }
        any_group || current
    }

    /// Creation contract: name, market, effectiveDate and conditions required
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.is_empty() {
            return Err(CoreError::MissingField("id"));
        }
        if self.name.is_empty() {
            return Err(CoreError::MissingField("name"));
        }
        if self.market.is_empty() {
            return Err(CoreError::MissingField("market"));
        }
        if self.conditions.is_empty() {
            return Err(CoreError::MissingField("conditions"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RuleContext {
        let mut c = RuleContext::new();
        c.set(attrs::MARKET, "US")
            .set(attrs::IS_HYPOTHECATABLE, true)
            .set(attrs::PROJECTED_NET, Decimal::from(5_000));
        c
    }

    fn rule(conditions: Vec<RuleCondition>) -> CalculationRule {
        CalculationRule {
            id: "R-1".to_string(),
            name: "hypothecatable long".to_string(),
            rule_type: RuleType::Include,
            market: "GLOBAL".to_string(),
            priority: 10,
            effective_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            expiry_date: None,
            status: RuleStatus::Active,
            conditions,
            actions: vec![RuleAction::new(RuleActionType::Include)],
            version: 1,
        }
    }

    #[test]
    fn test_simple_conditions() {
        let c = ctx();
        assert!(RuleCondition::new(attrs::MARKET, RuleOperator::Eq, "US").evaluate(&c));
        assert!(!RuleCondition::new(attrs::MARKET, RuleOperator::Eq, "JP").evaluate(&c));
        assert!(
            RuleCondition::new(attrs::PROJECTED_NET, RuleOperator::Gt, Decimal::ZERO).evaluate(&c)
        );
        assert!(RuleCondition::new(attrs::IS_HYPOTHECATABLE, RuleOperator::Eq, true).evaluate(&c));
    }

    #[test]
    fn test_unknown_attribute_is_closed_world() {
        let c = ctx();
        assert!(!RuleCondition::new("nonexistent", RuleOperator::Eq, "x").evaluate(&c));
        // IS_NULL is the one operator that matches absence
        let is_null = RuleCondition {
            attribute: "nonexistent".to_string(),
            operator: RuleOperator::IsNull,
            value: None,
            logical_operator: LogicalOperator::And,
        };
        assert!(is_null.evaluate(&c));
    }

    #[test]
    fn test_in_and_string_operators() {
        let c = ctx();
        let markets = AttrValue::List(vec!["US".into(), "GB".into()]);
        let cond = RuleCondition {
            attribute: attrs::MARKET.to_string(),
            operator: RuleOperator::In,
            value: Some(markets),
            logical_operator: LogicalOperator::And,
        };
        assert!(cond.evaluate(&c));

        let mut c2 = RuleContext::new();
        c2.set(attrs::SECURITY_TYPE, "EQUITY_ADR");
        assert!(
            RuleCondition::new(attrs::SECURITY_TYPE, RuleOperator::StartsWith, "EQUITY")
                .evaluate(&c2)
        );
        assert!(
            RuleCondition::new(attrs::SECURITY_TYPE, RuleOperator::EndsWith, "ADR").evaluate(&c2)
        );
        assert!(
            RuleCondition::new(attrs::SECURITY_TYPE, RuleOperator::Contains, "ITY_A").evaluate(&c2)
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        // market == "JP" AND isHypothecatable OR projectedNet > 0
        // With market=US the first group fails, the second group matches.
        let r = rule(vec![
            RuleCondition::new(attrs::MARKET, RuleOperator::Eq, "JP"),
            RuleCondition::new(attrs::IS_HYPOTHECATABLE, RuleOperator::Eq, true).or(),
            RuleCondition::new(attrs::PROJECTED_NET, RuleOperator::Gt, Decimal::ZERO),
        ]);
        assert!(r.matches(&ctx()));

        // market == "JP" AND (nothing else) never matches a US context
        let r2 = rule(vec![
            RuleCondition::new(attrs::MARKET, RuleOperator::Eq, "JP"),
            RuleCondition::new(attrs::PROJECTED_NET, RuleOperator::Gt, Decimal::ZERO),
        ]);
        assert!(!r2.matches(&ctx()));
    }

    #[test]
    fn test_effectivity_window() {
        let mut r = rule(vec![RuleCondition::new(
            attrs::MARKET,
            RuleOperator::Eq,
            "US",
        )]);
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert!(r.is_effective(today));

        r.expiry_date = Some(today);
        assert!(!r.is_effective(today));

        r.expiry_date = None;
        r.status = RuleStatus::Draft;
        assert!(!r.is_effective(today));
    }

    #[test]
    fn test_empty_conditions_never_match() {
        let r = rule(vec![]);
        assert!(!r.matches(&ctx()));
    }

    #[test]
    fn test_validate_requires_fields() {
        let mut r = rule(vec![RuleCondition::new(
            attrs::MARKET,
            RuleOperator::Eq,
            "US",
        )]);
        assert!(r.validate().is_ok());
        r.name.clear();
        assert_eq!(r.validate().unwrap_err().code(), "VALIDATION");
    }
}
