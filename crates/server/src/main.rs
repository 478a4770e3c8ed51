mod api;
mod cli;
mod metrics;

use anyhow::Result;
use engine::base_valuation::SqliteValuations;
use engine::universe::SqliteUniverse;
use engine::{EngineSettings, InsightEngine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "insights",
        &config.general.log_level,
        config.general.log_format,
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let settings = EngineSettings::from_config(&config);

    // CLI commands use sync Database and exit immediately.
    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    if cmd != cli::Command::Run {
        let mut db = common::db::Database::open(&config.database.path)?;
        db.run_migrations()?;
        cli::run_command(&mut db, &settings, cmd)?;
        return Ok(());
    }

    tracing::info!(db = %config.database.path, "insights server starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    // Dedicated background thread for SQLite; migrations run on open.
    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let engine = InsightEngine::new(
        db,
        Arc::new(SqliteUniverse),
        Arc::new(SqliteValuations),
        settings,
    );

    if config.server.api_key.is_none() {
        tracing::warn!("server.api_key not set; API is unauthenticated");
    }
    let state = Arc::new(api::AppState {
        engine,
        started_at: chrono::Utc::now(),
        api_key: config.server.api_key.clone(),
    });
    let app = api::router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
