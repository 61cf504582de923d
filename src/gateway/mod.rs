//! Gateway - synchronous API surface
//!
//! Thin axum layer the external REST/GraphQL facade calls into: position and
//! inventory queries, limit validation/usage, rule CRUD. Failures map
//! straight from the error kind to HTTP status.

pub mod handlers;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post, put};

use crate::limits::LimitEngine;
use crate::position::PositionEngine;
use crate::refdata::RefData;
use crate::repository::MemoryStore;
use crate::rules::RuleEngine;

/// Gateway application state (shared)
#[derive(Clone)]
pub struct AppState {
    /// Entity store (read path for queries)
    pub store: Arc<MemoryStore>,
    /// Rule book
    pub rules: Arc<RuleEngine>,
    /// Limit engine (synchronous validation path)
    pub limits: Arc<LimitEngine>,
    /// Reference data directory
    pub refdata: Arc<RefData>,
    /// Engine reserved for API-triggered recalculations
    pub recalc: Arc<Mutex<PositionEngine>>,
    /// Order-validation deadline
    pub validation_deadline: Duration,
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Positions
        .route("/positions", get(handlers::positions_by_date))
        .route(
            "/positions/{book_id}/{security_id}",
            get(handlers::position_by_key),
        )
        .route(
            "/positions/{book_id}/{security_id}/ladder",
            get(handlers::settlement_ladder),
        )
        .route(
            "/positions/recalculate",
            post(handlers::recalculate_positions),
        )
        // Inventory
        .route("/inventory", get(handlers::inventory_by_date))
        .route(
            "/inventory/security/{security_id}",
            get(handlers::inventory_by_security),
        )
        .route(
            "/inventory/type/{calculation_type}",
            get(handlers::inventory_by_type),
        )
        // Limits
        .route(
            "/limits/client/{client_id}/{security_id}",
            get(handlers::client_limit),
        )
        .route("/limits/au/{au_id}/{security_id}", get(handlers::au_limit))
        .route("/limits/validate", post(handlers::validate_order))
        .route("/limits/usage", post(handlers::update_usage))
        // Rules
        .route(
            "/rules",
            get(handlers::list_rules).post(handlers::create_rule),
        )
        .route("/rules/{id}", put(handlers::update_rule))
        .route("/rules/cache/clear", post(handlers::clear_rule_cache))
        .with_state(state)
}
