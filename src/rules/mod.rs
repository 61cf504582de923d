//! Rule Engine - versioned inclusion/exclusion/adjustment rules
//!
//! Holds the rule book behind copy-on-write snapshots, evaluates rule sets
//! against attribute contexts and applies market-specific context
//! adjustments (Taiwan no-relend, Japan SLAB cutoff and quanto settlement).

pub mod engine;
pub mod model;

pub use engine::RuleEngine;
pub use model::{
    AttrValue, CalculationRule, LogicalOperator, RuleAction, RuleActionType, RuleCondition,
    RuleContext, RuleOperator, RuleStatus, RuleType, attrs,
};
