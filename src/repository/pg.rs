//! PostgreSQL repository implementations
//!
//! One table per entity type, keyed as the domain keys are:
//!
//! - `positions_tb (book_id, security_id, business_date, ...)`
//! - `inventory_tb (security_id, calculation_type, business_date, counterparty_id, au_id, is_external, external_source, ...)`
//! - `client_limits_tb / au_limits_tb (owner_id, security_id, business_date, ...)`
//! - `rules_tb` + `rule_conditions_tb` + `rule_actions_tb`
//!
//! Every write carries `version` and `last_modified_at`. Writes are
//! idempotent upserts on the composite key.

use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::core_types::BusinessDate;
use crate::error::CoreError;
use crate::inventory::model::{
    CalculationType, InventoryAvailability, InventoryKey, InventoryStatus, SecurityTemperature,
};
use crate::limits::model::{
    AuLimit, ClientLimit, LimitCore, LimitKey, LimitStatus, LimitType,
};
use crate::models::{CalculationStatus, Position, PositionKey};
use crate::rules::model::{CalculationRule, RuleAction, RuleCondition, RuleStatus, RuleType};

use super::{InventoryRepository, LimitRepository, PositionRepository};

/// PostgreSQL connection pool wrapper
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ============================================================================
// Enum <-> text mapping
// ============================================================================

fn calc_status_to_str(s: CalculationStatus) -> &'static str {
    match s {
        CalculationStatus::Pending => "PENDING",
        CalculationStatus::Valid => "VALID",
        CalculationStatus::Invalid => "INVALID",
        CalculationStatus::Error => "ERROR",
    }
}

fn calc_status_from_str(s: &str) -> CalculationStatus {
    match s {
        "VALID" => CalculationStatus::Valid,
        "INVALID" => CalculationStatus::Invalid,
        "ERROR" => CalculationStatus::Error,
        _ => CalculationStatus::Pending,
    }
}

fn calc_type_from_str(s: &str) -> Option<CalculationType> {
    CalculationType::ALL.iter().copied().find(|t| t.as_str() == s)
}

fn temperature_to_str(t: SecurityTemperature) -> &'static str {
    match t {
        SecurityTemperature::Htb => "HTB",
        SecurityTemperature::Gc => "GC",
        SecurityTemperature::Warm => "WARM",
        SecurityTemperature::Cold => "COLD",
    }
}

fn temperature_from_str(s: &str) -> SecurityTemperature {
    match s {
        "HTB" => SecurityTemperature::Htb,
        "WARM" => SecurityTemperature::Warm,
        "COLD" => SecurityTemperature::Cold,
        _ => SecurityTemperature::Gc,
    }
}

fn inv_status_to_str(s: InventoryStatus) -> &'static str {
    match s {
        InventoryStatus::Active => "ACTIVE",
        InventoryStatus::Inactive => "INACTIVE",
        InventoryStatus::Pending => "PENDING",
        InventoryStatus::Error => "ERROR",
    }
}

fn inv_status_from_str(s: &str) -> InventoryStatus {
    match s {
        "ACTIVE" => InventoryStatus::Active,
        "INACTIVE" => InventoryStatus::Inactive,
        "ERROR" => InventoryStatus::Error,
        _ => InventoryStatus::Pending,
    }
}

fn limit_status_to_str(s: LimitStatus) -> &'static str {
    match s {
        LimitStatus::Active => "ACTIVE",
        LimitStatus::Suspended => "SUSPENDED",
        LimitStatus::Expired => "EXPIRED",
    }
}

fn limit_status_from_str(s: &str) -> LimitStatus {
    match s {
        "SUSPENDED" => LimitStatus::Suspended,
        "EXPIRED" => LimitStatus::Expired,
        _ => LimitStatus::Active,
    }
}

fn limit_type_to_str(t: LimitType) -> &'static str {
    match t {
        LimitType::Calculated => "CALCULATED",
        LimitType::Manual => "MANUAL",
    }
}

fn limit_type_from_str(s: &str) -> LimitType {
    match s {
        "MANUAL" => LimitType::Manual,
        _ => LimitType::Calculated,
    }
}

fn rule_type_to_str(t: RuleType) -> &'static str {
    match t {
        RuleType::Include => "INCLUDE",
        RuleType::Exclude => "EXCLUDE",
        RuleType::Adjust => "ADJUST",
        RuleType::Validate => "VALIDATE",
    }
}

fn rule_type_from_str(s: &str) -> RuleType {
    match s {
        "EXCLUDE" => RuleType::Exclude,
        "ADJUST" => RuleType::Adjust,
        "VALIDATE" => RuleType::Validate,
        _ => RuleType::Include,
    }
}

fn rule_status_to_str(s: RuleStatus) -> &'static str {
    match s {
        RuleStatus::Active => "ACTIVE",
        RuleStatus::Inactive => "INACTIVE",
        RuleStatus::Draft => "DRAFT",
        RuleStatus::Deprecated => "DEPRECATED",
    }
}

fn rule_status_from_str(s: &str) -> RuleStatus {
    match s {
        "ACTIVE" => RuleStatus::Active,
        "INACTIVE" => RuleStatus::Inactive,
        "DEPRECATED" => RuleStatus::Deprecated,
        _ => RuleStatus::Draft,
    }
}

// ============================================================================
// Position repository
// ============================================================================

pub struct PgPositionRepository {
    pool: PgPool,
}

impl PgPositionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_position(row: &PgRow) -> Result<Position, sqlx::Error> {
        let deliver: [Decimal; 5] = [
            row.try_get("sd0_deliver")?,
            row.try_get("sd1_deliver")?,
            row.try_get("sd2_deliver")?,
            row.try_get("sd3_deliver")?,
            row.try_get("sd4_deliver")?,
        ];
        let receipt: [Decimal; 5] = [
            row.try_get("sd0_receipt")?,
            row.try_get("sd1_receipt")?,
            row.try_get("sd2_receipt")?,
            row.try_get("sd3_receipt")?,
            row.try_get("sd4_receipt")?,
        ];
        let status: String = row.try_get("calculation_status")?;
        let rule_version: Option<i64> = row.try_get("calculation_rule_version")?;
        let version: i64 = row.try_get("version")?;

        Ok(Position {
            key: PositionKey {
                book_id: row.try_get("book_id")?,
                security_id: row.try_get("security_id")?,
                business_date: row.try_get("business_date")?,
            },
            contractual_qty: row.try_get("contractual_qty")?,
            settled_qty: row.try_get("settled_qty")?,
            sd_deliver: deliver,
            sd_receipt: receipt,
            ladder_overflow: row.try_get("ladder_overflow")?,
            current_net_position: row.try_get("current_net")?,
            projected_net_position: row.try_get("projected_net")?,
            is_hypothecatable: row.try_get("is_hypothecatable")?,
            is_reserved: row.try_get("is_reserved")?,
            is_borrowed: row.try_get("is_borrowed")?,
            is_start_of_day: row.try_get("is_start_of_day")?,
            calculation_status: calc_status_from_str(&status),
            calculation_rule_id: row.try_get("calculation_rule_id")?,
            calculation_rule_version: rule_version.map(|v| v as u64),
            calculation_date: row.try_get("calculation_date")?,
            version: version as u64,
            last_modified_at: row.try_get("last_modified_at")?,
        })
    }

    async fn fetch_where(
        &self,
        sql: &str,
        binds: Vec<PositionBind<'_>>,
    ) -> Result<Vec<Position>, CoreError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                PositionBind::Text(v) => query.bind(v),
                PositionBind::Date(v) => query.bind(v),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| Self::row_to_position(r).map_err(CoreError::from))
            .collect()
    }
}

enum PositionBind<'a> {
    Text(&'a str),
    Date(BusinessDate),
}

const POSITION_COLUMNS: &str = "book_id, security_id, business_date, contractual_qty, settled_qty, \
     sd0_deliver, sd1_deliver, sd2_deliver, sd3_deliver, sd4_deliver, \
     sd0_receipt, sd1_receipt, sd2_receipt, sd3_receipt, sd4_receipt, \
     ladder_overflow, current_net, projected_net, \
     is_hypothecatable, is_reserved, is_borrowed, is_start_of_day, \
     calculation_status, calculation_rule_id, calculation_rule_version, calculation_date, \
     version, last_modified_at";

#[async_trait]
impl PositionRepository for PgPositionRepository {
    async fn find(&self, key: &PositionKey) -> Result<Option<Position>, CoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions_tb \
             WHERE book_id = $1 AND security_id = $2 AND business_date = $3"
        );
        let row = sqlx::query(&sql)
            .bind(&key.book_id)
            .bind(&key.security_id)
            .bind(key.business_date)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_position(&r).map_err(CoreError::from))
            .transpose()
    }

    async fn find_by_business_date(&self, date: BusinessDate) -> Result<Vec<Position>, CoreError> {
        let sql =
            format!("SELECT {POSITION_COLUMNS} FROM positions_tb WHERE business_date = $1");
        self.fetch_where(&sql, vec![PositionBind::Date(date)]).await
    }

    async fn find_by_security_and_date(
        &self,
        security_id: &str,
        date: BusinessDate,
    ) -> Result<Vec<Position>, CoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions_tb \
             WHERE security_id = $1 AND business_date = $2"
        );
        self.fetch_where(
            &sql,
            vec![PositionBind::Text(security_id), PositionBind::Date(date)],
        )
        .await
    }

    async fn find_by_status(
        &self,
        date: BusinessDate,
        status: CalculationStatus,
    ) -> Result<Vec<Position>, CoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions_tb \
             WHERE business_date = $1 AND calculation_status = $2"
        );
        self.fetch_where(
            &sql,
            vec![
                PositionBind::Date(date),
                PositionBind::Text(calc_status_to_str(status)),
            ],
        )
        .await
    }

    async fn save(&self, position: Position) -> Result<Position, CoreError> {
        sqlx::query(
            "INSERT INTO positions_tb (\
                 book_id, security_id, business_date, contractual_qty, settled_qty, \
                 sd0_deliver, sd1_deliver, sd2_deliver, sd3_deliver, sd4_deliver, \
                 sd0_receipt, sd1_receipt, sd2_receipt, sd3_receipt, sd4_receipt, \
                 ladder_overflow, current_net, projected_net, \
                 is_hypothecatable, is_reserved, is_borrowed, is_start_of_day, \
                 calculation_status, calculation_rule_id, calculation_rule_version, \
                 calculation_date, version, last_modified_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,\
                     $19,$20,$21,$22,$23,$24,$25,$26,$27,$28) \
             ON CONFLICT (book_id, security_id, business_date) DO UPDATE SET \
                 contractual_qty = EXCLUDED.contractual_qty, \
                 settled_qty = EXCLUDED.settled_qty, \
                 sd0_deliver = EXCLUDED.sd0_deliver, sd1_deliver = EXCLUDED.sd1_deliver, \
                 sd2_deliver = EXCLUDED.sd2_deliver, sd3_deliver = EXCLUDED.sd3_deliver, \
                 sd4_deliver = EXCLUDED.sd4_deliver, \
                 sd0_receipt = EXCLUDED.sd0_receipt, sd1_receipt = EXCLUDED.sd1_receipt, \
                 sd2_receipt = EXCLUDED.sd2_receipt, sd3_receipt = EXCLUDED.sd3_receipt, \
                 sd4_receipt = EXCLUDED.sd4_receipt, \
                 ladder_overflow = EXCLUDED.ladder_overflow, \
                 current_net = EXCLUDED.current_net, \
                 projected_net = EXCLUDED.projected_net, \
                 is_hypothecatable = EXCLUDED.is_hypothecatable, \
                 is_reserved = EXCLUDED.is_reserved, \
                 is_borrowed = EXCLUDED.is_borrowed, \
                 is_start_of_day = EXCLUDED.is_start_of_day, \
                 calculation_status = EXCLUDED.calculation_status, \
                 calculation_rule_id = EXCLUDED.calculation_rule_id, \
                 calculation_rule_version = EXCLUDED.calculation_rule_version, \
                 calculation_date = EXCLUDED.calculation_date, \
                 version = EXCLUDED.version, \
                 last_modified_at = EXCLUDED.last_modified_at",
        )
        .bind(&position.key.book_id)
        .bind(&position.key.security_id)
        .bind(position.key.business_date)
        .bind(position.contractual_qty)
        .bind(position.settled_qty)
        .bind(position.sd_deliver[0])
        .bind(position.sd_deliver[1])
        .bind(position.sd_deliver[2])
        .bind(position.sd_deliver[3])
        .bind(position.sd_deliver[4])
        .bind(position.sd_receipt[0])
        .bind(position.sd_receipt[1])
        .bind(position.sd_receipt[2])
        .bind(position.sd_receipt[3])
        .bind(position.sd_receipt[4])
        .bind(position.ladder_overflow)
        .bind(position.current_net_position)
        .bind(position.projected_net_position)
        .bind(position.is_hypothecatable)
        .bind(position.is_reserved)
        .bind(position.is_borrowed)
        .bind(position.is_start_of_day)
        .bind(calc_status_to_str(position.calculation_status))
        .bind(&position.calculation_rule_id)
        .bind(position.calculation_rule_version.map(|v| v as i64))
        .bind(position.calculation_date)
        .bind(position.version as i64)
        .bind(position.last_modified_at)
        .execute(&self.pool)
        .await?;

        Ok(position)
    }

    async fn save_all(&self, positions: Vec<Position>) -> Result<usize, CoreError> {
        let count = positions.len();
        for p in positions {
            self.save(p).await?;
        }
        Ok(count)
    }
}

// ============================================================================
// Inventory repository
// ============================================================================

pub struct PgInventoryRepository {
    pool: PgPool,
}

impl PgInventoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_availability(row: &PgRow) -> Result<InventoryAvailability, sqlx::Error> {
        let calc_type: String = row.try_get("calculation_type")?;
        let temperature: String = row.try_get("security_temperature")?;
        let status: String = row.try_get("status")?;
        let rule_version: Option<i64> = row.try_get("calculation_rule_version")?;
        let version: i64 = row.try_get("version")?;

        Ok(InventoryAvailability {
            key: InventoryKey {
                security_id: row.try_get("security_id")?,
                calculation_type: calc_type_from_str(&calc_type)
                    .unwrap_or(CalculationType::ForLoan),
                business_date: row.try_get("business_date")?,
                counterparty_id: row.try_get("counterparty_id")?,
                aggregation_unit_id: row.try_get("au_id")?,
                is_external_source: row.try_get("is_external")?,
                external_source_name: row.try_get("external_source")?,
            },
            gross_quantity: row.try_get("gross_qty")?,
            net_quantity: row.try_get("net_qty")?,
            available_quantity: row.try_get("available_qty")?,
            reserved_quantity: row.try_get("reserved_qty")?,
            decrement_quantity: row.try_get("decrement_qty")?,
            market: row.try_get("market")?,
            security_temperature: temperature_from_str(&temperature),
            borrow_rate: row.try_get("borrow_rate")?,
            calculation_rule_id: row.try_get("calculation_rule_id")?,
            calculation_rule_version: rule_version.map(|v| v as u64),
            status: inv_status_from_str(&status),
            version: version as u64,
            last_modified_at: row.try_get("last_modified_at")?,
        })
    }
}

const INVENTORY_COLUMNS: &str = "security_id, calculation_type, business_date, counterparty_id, au_id, \
     is_external, external_source, gross_qty, net_qty, available_qty, reserved_qty, \
     decrement_qty, market, security_temperature, borrow_rate, \
     calculation_rule_id, calculation_rule_version, status, version, last_modified_at";

#[async_trait]
impl InventoryRepository for PgInventoryRepository {
    async fn find(&self, key: &InventoryKey) -> Result<Option<InventoryAvailability>, CoreError> {
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory_tb \
             WHERE security_id = $1 AND calculation_type = $2 AND business_date = $3 \
               AND counterparty_id IS NOT DISTINCT FROM $4 \
               AND au_id IS NOT DISTINCT FROM $5 \
               AND is_external = $6 \
               AND external_source IS NOT DISTINCT FROM $7"
        );
        let row = sqlx::query(&sql)
            .bind(&key.security_id)
            .bind(key.calculation_type.as_str())
            .bind(key.business_date)
            .bind(&key.counterparty_id)
            .bind(&key.aggregation_unit_id)
            .bind(key.is_external_source)
            .bind(&key.external_source_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_availability(&r).map_err(CoreError::from))
            .transpose()
    }

    async fn find_by_business_date(
        &self,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let sql = format!("SELECT {INVENTORY_COLUMNS} FROM inventory_tb WHERE business_date = $1");
        let rows = sqlx::query(&sql).bind(date).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| Self::row_to_availability(r).map_err(CoreError::from))
            .collect()
    }

    async fn find_by_security_and_date(
        &self,
        security_id: &str,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory_tb \
             WHERE security_id = $1 AND business_date = $2"
        );
        let rows = sqlx::query(&sql)
            .bind(security_id)
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::row_to_availability(r).map_err(CoreError::from))
            .collect()
    }

    async fn find_by_type_and_date(
        &self,
        calculation_type: CalculationType,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory_tb \
             WHERE calculation_type = $1 AND business_date = $2"
        );
        let rows = sqlx::query(&sql)
            .bind(calculation_type.as_str())
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::row_to_availability(r).map_err(CoreError::from))
            .collect()
    }

    async fn find_by_market_and_date(
        &self,
        market: &str,
        date: BusinessDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory_tb \
             WHERE market = $1 AND business_date = $2"
        );
        let rows = sqlx::query(&sql)
            .bind(market)
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::row_to_availability(r).map_err(CoreError::from))
            .collect()
    }

    async fn save(
        &self,
        availability: InventoryAvailability,
    ) -> Result<InventoryAvailability, CoreError> {
        sqlx::query(
            "INSERT INTO inventory_tb (\
                 security_id, calculation_type, business_date, counterparty_id, au_id, \
                 is_external, external_source, gross_qty, net_qty, available_qty, \
                 reserved_qty, decrement_qty, market, security_temperature, borrow_rate, \
                 calculation_rule_id, calculation_rule_version, status, version, last_modified_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20) \
             ON CONFLICT (security_id, calculation_type, business_date, counterparty_id, \
                          au_id, is_external, external_source) DO UPDATE SET \
                 gross_qty = EXCLUDED.gross_qty, \
                 net_qty = EXCLUDED.net_qty, \
                 available_qty = EXCLUDED.available_qty, \
                 reserved_qty = EXCLUDED.reserved_qty, \
                 decrement_qty = EXCLUDED.decrement_qty, \
                 market = EXCLUDED.market, \
                 security_temperature = EXCLUDED.security_temperature, \
                 borrow_rate = EXCLUDED.borrow_rate, \
                 calculation_rule_id = EXCLUDED.calculation_rule_id, \
                 calculation_rule_version = EXCLUDED.calculation_rule_version, \
                 status = EXCLUDED.status, \
                 version = EXCLUDED.version, \
                 last_modified_at = EXCLUDED.last_modified_at",
        )
        .bind(&availability.key.security_id)
        .bind(availability.key.calculation_type.as_str())
        .bind(availability.key.business_date)
        .bind(&availability.key.counterparty_id)
        .bind(&availability.key.aggregation_unit_id)
        .bind(availability.key.is_external_source)
        .bind(&availability.key.external_source_name)
        .bind(availability.gross_quantity)
        .bind(availability.net_quantity)
        .bind(availability.available_quantity)
        .bind(availability.reserved_quantity)
        .bind(availability.decrement_quantity)
        .bind(&availability.market)
        .bind(temperature_to_str(availability.security_temperature))
        .bind(availability.borrow_rate)
        .bind(&availability.calculation_rule_id)
        .bind(availability.calculation_rule_version.map(|v| v as i64))
        .bind(inv_status_to_str(availability.status))
        .bind(availability.version as i64)
        .bind(availability.last_modified_at)
        .execute(&self.pool)
        .await?;

        Ok(availability)
    }

    async fn save_all(&self, rows: Vec<InventoryAvailability>) -> Result<usize, CoreError> {
        let count = rows.len();
        for r in rows {
            self.save(r).await?;
        }
        Ok(count)
    }
}

// ============================================================================
// Limit repository
// ============================================================================

pub struct PgLimitRepository {
    pool: PgPool,
}

impl PgLimitRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_core(row: &PgRow) -> Result<LimitCore, sqlx::Error> {
        let limit_type: String = row.try_get("limit_type")?;
        let status: String = row.try_get("status")?;
        Ok(LimitCore {
            key: LimitKey {
                owner_id: row.try_get("owner_id")?,
                security_id: row.try_get("security_id")?,
                business_date: row.try_get("business_date")?,
            },
            long_sell_limit: row.try_get("long_sell_limit")?,
            short_sell_limit: row.try_get("short_sell_limit")?,
            long_sell_used: row.try_get("long_sell_used")?,
            short_sell_used: row.try_get("short_sell_used")?,
            currency: row.try_get("currency")?,
            limit_type: limit_type_from_str(&limit_type),
            market: row.try_get("market")?,
            status: limit_status_from_str(&status),
            last_updated: row.try_get("last_updated")?,
        })
    }

    async fn save_core(&self, table: &str, core: &LimitCore, rules: &str) -> Result<(), CoreError> {
        let sql = format!(
            "INSERT INTO {table} (\
                 owner_id, security_id, business_date, long_sell_limit, short_sell_limit, \
                 long_sell_used, short_sell_used, currency, limit_type, market, status, \
                 market_specific_rules, last_updated) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13) \
             ON CONFLICT (owner_id, security_id, business_date) DO UPDATE SET \
                 long_sell_limit = EXCLUDED.long_sell_limit, \
                 short_sell_limit = EXCLUDED.short_sell_limit, \
                 long_sell_used = EXCLUDED.long_sell_used, \
                 short_sell_used = EXCLUDED.short_sell_used, \
                 currency = EXCLUDED.currency, \
                 limit_type = EXCLUDED.limit_type, \
                 market = EXCLUDED.market, \
                 status = EXCLUDED.status, \
                 market_specific_rules = EXCLUDED.market_specific_rules, \
                 last_updated = EXCLUDED.last_updated"
        );
        sqlx::query(&sql)
            .bind(&core.key.owner_id)
            .bind(&core.key.security_id)
            .bind(core.key.business_date)
            .bind(core.long_sell_limit)
            .bind(core.short_sell_limit)
            .bind(core.long_sell_used)
            .bind(core.short_sell_used)
            .bind(&core.currency)
            .bind(limit_type_to_str(core.limit_type))
            .bind(&core.market)
            .bind(limit_status_to_str(core.status))
            .bind(rules)
            .bind(core.last_updated)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const LIMIT_COLUMNS: &str = "owner_id, security_id, business_date, long_sell_limit, short_sell_limit, \
     long_sell_used, short_sell_used, currency, limit_type, market, status, \
     market_specific_rules, last_updated";

#[async_trait]
impl LimitRepository for PgLimitRepository {
    async fn find_client_limit(&self, key: &LimitKey) -> Result<Option<ClientLimit>, CoreError> {
        let sql = format!(
            "SELECT {LIMIT_COLUMNS} FROM client_limits_tb \
             WHERE owner_id = $1 AND security_id = $2 AND business_date = $3"
        );
        let row = sqlx::query(&sql)
            .bind(&key.owner_id)
            .bind(&key.security_id)
            .bind(key.business_date)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_core(&r).map(ClientLimit::new).map_err(CoreError::from))
            .transpose()
    }

    async fn find_au_limit(&self, key: &LimitKey) -> Result<Option<AuLimit>, CoreError> {
        let sql = format!(
            "SELECT {LIMIT_COLUMNS} FROM au_limits_tb \
             WHERE owner_id = $1 AND security_id = $2 AND business_date = $3"
        );
        let row = sqlx::query(&sql)
            .bind(&key.owner_id)
            .bind(&key.security_id)
            .bind(key.business_date)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let rules: String = r.try_get("market_specific_rules")?;
            let mut limit = AuLimit::new(Self::row_to_core(&r)?);
            limit.market_specific_rules = rules
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            Ok::<AuLimit, sqlx::Error>(limit)
        })
        .transpose()
        .map_err(CoreError::from)
    }

    async fn find_client_limits_by_date(
        &self,
        date: BusinessDate,
    ) -> Result<Vec<ClientLimit>, CoreError> {
        let sql = format!("SELECT {LIMIT_COLUMNS} FROM client_limits_tb WHERE business_date = $1");
        let rows = sqlx::query(&sql).bind(date).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Self::row_to_core(r)
                    .map(ClientLimit::new)
                    .map_err(CoreError::from)
            })
            .collect()
    }

    async fn find_au_limits_by_date(&self, date: BusinessDate) -> Result<Vec<AuLimit>, CoreError> {
        let sql = format!("SELECT {LIMIT_COLUMNS} FROM au_limits_tb WHERE business_date = $1");
        let rows = sqlx::query(&sql).bind(date).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                let rules: String = r.try_get("market_specific_rules")?;
                let mut limit = AuLimit::new(Self::row_to_core(r)?);
                limit.market_specific_rules = rules
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(limit)
            })
            .collect::<Result<Vec<AuLimit>, sqlx::Error>>()
            .map_err(CoreError::from)
    }

    async fn save_client_limit(&self, limit: ClientLimit) -> Result<ClientLimit, CoreError> {
        self.save_core("client_limits_tb", &limit.core, "").await?;
        Ok(limit)
    }

    async fn save_au_limit(&self, limit: AuLimit) -> Result<AuLimit, CoreError> {
        let rules = limit.market_specific_rules.join(",");
        self.save_core("au_limits_tb", &limit.core, &rules).await?;
        Ok(limit)
    }
}

// ============================================================================
// Rule store
// ============================================================================

/// Persists the rule book across restarts. The in-memory RuleEngine is the
/// evaluation authority; this store is load-at-boot / write-through.
pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_all(&self) -> Result<Vec<CalculationRule>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, name, rule_type, market, priority, effective_date, expiry_date, \
                    status, conditions, actions, version \
             FROM rules_tb",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let rule_type: String = row.try_get("rule_type")?;
                let status: String = row.try_get("status")?;
                let conditions: serde_json::Value = row.try_get("conditions")?;
                let actions: serde_json::Value = row.try_get("actions")?;
                let version: i64 = row.try_get("version")?;
                Ok(CalculationRule {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    rule_type: rule_type_from_str(&rule_type),
                    market: row.try_get("market")?,
                    priority: row.try_get("priority")?,
                    effective_date: row.try_get("effective_date")?,
                    expiry_date: row.try_get("expiry_date")?,
                    status: rule_status_from_str(&status),
                    conditions: serde_json::from_value::<Vec<RuleCondition>>(conditions)
                        .unwrap_or_default(),
                    actions: serde_json::from_value::<Vec<RuleAction>>(actions)
                        .unwrap_or_default(),
                    version: version as u64,
                })
            })
            .collect::<Result<Vec<CalculationRule>, sqlx::Error>>()
            .map_err(CoreError::from)
    }

    pub async fn save(&self, rule: &CalculationRule) -> Result<(), CoreError> {
        let conditions = serde_json::to_value(&rule.conditions).unwrap_or_default();
        let actions = serde_json::to_value(&rule.actions).unwrap_or_default();
        sqlx::query(
            "INSERT INTO rules_tb (id, name, rule_type, market, priority, effective_date, \
                                   expiry_date, status, conditions, actions, version) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, \
                 rule_type = EXCLUDED.rule_type, \
                 market = EXCLUDED.market, \
                 priority = EXCLUDED.priority, \
                 effective_date = EXCLUDED.effective_date, \
                 expiry_date = EXCLUDED.expiry_date, \
                 status = EXCLUDED.status, \
                 conditions = EXCLUDED.conditions, \
                 actions = EXCLUDED.actions, \
                 version = EXCLUDED.version",
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule_type_to_str(rule.rule_type))
        .bind(&rule.market)
        .bind(rule.priority)
        .bind(rule.effective_date)
        .bind(rule.expiry_date)
        .bind(rule_status_to_str(rule.status))
        .bind(conditions)
        .bind(actions)
        .bind(rule.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for s in [
            CalculationStatus::Pending,
            CalculationStatus::Valid,
            CalculationStatus::Invalid,
            CalculationStatus::Error,
        ] {
            assert_eq!(calc_status_from_str(calc_status_to_str(s)), s);
        }
        for t in CalculationType::ALL {
            assert_eq!(calc_type_from_str(t.as_str()), Some(t));
        }
        for t in [
            SecurityTemperature::Htb,
            SecurityTemperature::Gc,
            SecurityTemperature::Warm,
            SecurityTemperature::Cold,
        ] {
            assert_eq!(temperature_from_str(temperature_to_str(t)), t);
        }
    }
}
