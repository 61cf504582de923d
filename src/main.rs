//! IMS Calculation Core - service entry point
//!
//! Boot sequence:
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│  Logging  │───▶│ Rule book +  │───▶│ Gateway  │
//! │  (YAML)  │    │ (tracing) │    │  engines     │    │  (axum)  │
//! └──────────┘    └───────────┘    └──────────────┘    └──────────┘
//! ```
//!
//! The event pipeline attaches to the bus consumers in deployment; here the
//! binary brings up the synchronous API over the shared store so the facade
//! can query, validate and manage rules.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use ims_calc_core::config::AppConfig;
use ims_calc_core::gateway::{self, AppState};
use ims_calc_core::limits::LimitEngine;
use ims_calc_core::logging;
use ims_calc_core::position::PositionEngine;
use ims_calc_core::refdata::RefData;
use ims_calc_core::repository::MemoryStore;
use ims_calc_core::repository::pg::{Database, PgRuleStore};
use ims_calc_core::rules::RuleEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/core.yaml".to_string());
    let config = AppConfig::from_file(&config_path).unwrap_or_default();

    let _log_guard = logging::init_logging(&config.logging);
    info!(
        service = %config.service.name,
        shards = config.effective_shard_count(),
        "Calculation core starting"
    );

    let store = MemoryStore::new();
    let refdata = Arc::new(RefData::new());

    // Rule book: load persisted rules when a database is configured
    let rules = match &config.database {
        Some(db_config) => {
            let db = Database::connect(&db_config.url)
                .await
                .context("connecting to PostgreSQL")?;
            let rule_store = PgRuleStore::new(db.pool().clone());
            let persisted = rule_store
                .load_all()
                .await
                .context("loading rule book")?;
            info!(rules = persisted.len(), "Rule book loaded from store");
            Arc::new(RuleEngine::with_rules(persisted))
        }
        None => Arc::new(RuleEngine::new()),
    };

    let limits = LimitEngine::new(store.clone(), refdata.clone());
    let recalc = Arc::new(Mutex::new(PositionEngine::new(
        store.clone(),
        refdata.clone(),
        config.markets.jp_cutoff_time_utc,
    )));

    let state = AppState {
        store,
        rules,
        limits,
        refdata,
        recalc,
        validation_deadline: Duration::from_millis(config.deadlines.order_validation_ms),
    };

    let app = gateway::router(state);
    let listener = tokio::net::TcpListener::bind(&config.service.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.service.listen_addr))?;
    info!(addr = %config.service.listen_addr, "Gateway listening");

    axum::serve(listener, app).await.context("gateway serve")?;
    Ok(())
}
