//! Gateway request handlers
//!
//! Every handler returns `Result<Json<T>, ApiError>`; `ApiError` carries the
//! core error straight through to the documented status mapping
//! (400 VALIDATION, 404 NOT_FOUND, 409 CONFLICT, 504 TIMEOUT, 5xx otherwise).

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core_types::{BusinessDate, Qty};
use crate::error::CoreError;
use crate::inventory::model::{CalculationType, InventoryAvailability};
use crate::limits::model::{AuLimit, ClientLimit, LimitKey, OrderType};
use crate::models::{CalculationStatus, Position, PositionKey, SettlementLadder};
use crate::rules::model::CalculationRule;

use super::AppState;

// ============================================================
// ERROR MAPPING
// ============================================================

/// CoreError wrapper implementing the REST status contract
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

// ============================================================
// COMMON QUERY SHAPES
// ============================================================

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub business_date: BusinessDate,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "time": Utc::now() }))
}

// ============================================================
// POSITIONS
// ============================================================

pub async fn positions_by_date(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Json<Vec<Position>> {
    Json(state.store.positions_for_date(query.business_date))
}

pub async fn position_by_key(
    State(state): State<AppState>,
    Path((book_id, security_id)): Path<(String, String)>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Position>, ApiError> {
    let key = PositionKey::new(book_id, security_id, query.business_date);
    state
        .store
        .get_position(&key)
        .map(Json)
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("position {:?}", key))))
}

pub async fn settlement_ladder(
    State(state): State<AppState>,
    Path((book_id, security_id)): Path<(String, String)>,
    Query(query): Query<DateQuery>,
) -> Result<Json<SettlementLadder>, ApiError> {
    let key = PositionKey::new(book_id, security_id, query.business_date);
    state
        .store
        .get_position(&key)
        .map(|p| Json(p.settlement_ladder()))
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("position {:?}", key))))
}

#[derive(Debug, Deserialize)]
pub struct RecalculateRequest {
    pub business_date: BusinessDate,
    pub status: CalculationStatus,
}

#[derive(Debug, Serialize)]
pub struct RecalculateResponse {
    pub updated: usize,
}

pub async fn recalculate_positions(
    State(state): State<AppState>,
    Json(request): Json<RecalculateRequest>,
) -> Result<Json<RecalculateResponse>, ApiError> {
    let updated = {
        let mut engine = state
            .recalc
            .lock()
            .map_err(|_| CoreError::InvariantViolated("recalc engine poisoned".to_string()))?;
        engine.recalculate_positions(request.business_date, request.status)
    };
    Ok(Json(RecalculateResponse {
        updated: updated.len(),
    }))
}

// ============================================================
// INVENTORY
// ============================================================

pub async fn inventory_by_date(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Json<Vec<InventoryAvailability>> {
    Json(state.store.inventory_for_date(query.business_date))
}

pub async fn inventory_by_security(
    State(state): State<AppState>,
    Path(security_id): Path<String>,
    Query(query): Query<DateQuery>,
) -> Json<Vec<InventoryAvailability>> {
    Json(
        state
            .store
            .inventory_for_security(&security_id, query.business_date),
    )
}

pub async fn inventory_by_type(
    State(state): State<AppState>,
    Path(calculation_type): Path<CalculationType>,
    Query(query): Query<DateQuery>,
) -> Json<Vec<InventoryAvailability>> {
    Json(
        state
            .store
            .inventory_by_type(calculation_type, query.business_date),
    )
}

// ============================================================
// LIMITS
// ============================================================

pub async fn client_limit(
    State(state): State<AppState>,
    Path((client_id, security_id)): Path<(String, String)>,
    Query(query): Query<DateQuery>,
) -> Result<Json<ClientLimit>, ApiError> {
    let key = LimitKey::new(client_id, security_id, query.business_date);
    state
        .store
        .get_client_limit(&key)
        .map(Json)
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("client limit {}", key.owner_id))))
}

pub async fn au_limit(
    State(state): State<AppState>,
    Path((au_id, security_id)): Path<(String, String)>,
    Query(query): Query<DateQuery>,
) -> Result<Json<AuLimit>, ApiError> {
    let key = LimitKey::new(au_id, security_id, query.business_date);
    state
        .store
        .get_au_limit(&key)
        .map(Json)
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("AU limit {}", key.owner_id))))
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderCheckRequest {
    pub client_id: String,
    pub au_id: String,
    pub security_id: String,
    pub order_type: OrderType,
    pub quantity: Qty,
    pub business_date: BusinessDate,
}

#[derive(Debug, Serialize)]
pub struct OrderCheckResponse {
    pub approved: bool,
}

/// Synchronous short/long-sell validation under the 150 ms deadline
pub async fn validate_order(
    State(state): State<AppState>,
    Json(request): Json<OrderCheckRequest>,
) -> Result<Json<OrderCheckResponse>, ApiError> {
    let deadline = state.validation_deadline;
    let limits = state.limits.clone();

    let verdict = tokio::time::timeout(
        deadline,
        tokio::task::spawn_blocking(move || {
            limits.validate_order_against_limits(
                &request.client_id,
                &request.au_id,
                &request.security_id,
                request.order_type,
                request.quantity,
                request.business_date,
            )
        }),
    )
    .await
    .map_err(|_| CoreError::DeadlineExceeded(deadline.as_millis() as u64))?
    .map_err(|e| CoreError::InvariantViolated(format!("validation task failed: {e}")))?;

    Ok(Json(OrderCheckResponse { approved: verdict }))
}

pub async fn update_usage(
    State(state): State<AppState>,
    Json(request): Json<OrderCheckRequest>,
) -> Result<StatusCode, ApiError> {
    state.limits.update_limit_usage(
        &request.client_id,
        &request.au_id,
        &request.security_id,
        request.order_type,
        request.quantity,
        request.business_date,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================
// RULES
// ============================================================

#[derive(Debug, Deserialize)]
pub struct RuleQuery {
    pub business_date: Option<BusinessDate>,
}

pub async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<RuleQuery>,
) -> Json<Vec<CalculationRule>> {
    let today = query
        .business_date
        .unwrap_or_else(|| Utc::now().date_naive());
    Json(state.rules.get_active_rules(today))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(rule): Json<CalculationRule>,
) -> Result<(StatusCode, Json<CalculationRule>), ApiError> {
    let created = state.rules.create_rule(rule)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut rule): Json<CalculationRule>,
) -> Result<Json<CalculationRule>, ApiError> {
    rule.id = id;
    let updated = state.rules.update_rule(rule)?;
    Ok(Json(updated))
}

pub async fn clear_rule_cache(State(state): State<AppState>) -> StatusCode {
    state.rules.invalidate_cache();
    StatusCode::NO_CONTENT
}
