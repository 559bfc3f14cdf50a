//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the REST API server on its own.
//!
//! ## Intended use
//! Useful for development and debugging. The workspace's main `emr-run` binary does the same
//! startup and additionally waits for the audit writer to drain on shutdown.

use anyhow::Context;
use api_rest::{build_router, ApiConfig, AppState};
use emr_core::{db, spawn_writer, AuditLog, CoreConfig, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the EMR REST API server
///
/// # Environment Variables
/// - `EMR_REST_ADDR`: Server address (default: "0.0.0.0:3000")
/// - `EMR_DATABASE_URL`: SQLite URL (default: "sqlite://emr.db?mode=rwc")
/// - `EMR_DB_MAX_CONNECTIONS`: Pool size (default: 5)
/// - `EMR_JWT_SECRET`: Token signing secret, at least 32 bytes (required)
/// - `EMR_ENV`: `development` exposes internal error detail in responses
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the configuration is invalid or the database cannot be opened and migrated,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let core_cfg = CoreConfig::from_env_values(
        std::env::var("EMR_DATABASE_URL").ok(),
        std::env::var("EMR_DB_MAX_CONNECTIONS").ok(),
    )?;
    let api_cfg = ApiConfig::from_env_values(
        std::env::var("EMR_REST_ADDR").ok(),
        std::env::var("EMR_JWT_SECRET").ok(),
        std::env::var("EMR_ENV").ok(),
    )?;

    let pool = db::connect(&core_cfg)
        .await
        .context("failed to open database")?;
    db::migrate(&pool).await.context("failed to migrate database")?;

    let (audit, receiver) = AuditLog::channel();
    spawn_writer(pool.clone(), receiver);

    let addr = api_cfg.addr().to_string();
    tracing::info!("-- Starting EMR REST API on {}", addr);

    let app = build_router(AppState::new(Store::new(pool, audit), api_cfg));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
