use anyhow::Context;
use api_rest::{ApiConfig, AppState, build_router};
use emr_core::{AuditLog, CoreConfig, Store, db, spawn_writer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the EMR application
///
/// Opens and migrates the database, starts the audit writer and serves the REST API until
/// interrupted. On shutdown, queued audit events are flushed before exiting.
///
/// # Environment Variables
/// - `EMR_DATABASE_URL`: SQLite URL (default: "sqlite://emr.db?mode=rwc")
/// - `EMR_DB_MAX_CONNECTIONS`: Pool size (default: 5)
/// - `EMR_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `EMR_JWT_SECRET`: Token signing secret, at least 32 bytes (required)
/// - `EMR_ENV`: `development` exposes internal error detail in responses
///
/// # Returns
/// * `Ok(())` - If the server starts and shuts down cleanly
/// * `Err(anyhow::Error)` - If configuration, startup or serving fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("emr=info".parse()?)
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
    db::migrate(&pool)
        .await
        .context("failed to migrate database")?;
    tracing::info!(url = core_cfg.database_url(), "database ready");

    let (audit, receiver) = AuditLog::channel();
    let writer = spawn_writer(pool.clone(), receiver);

    let rest_addr = api_cfg.addr().to_string();
    let app = build_router(AppState::new(Store::new(pool, audit), api_cfg));

    tracing::info!("++ Starting EMR REST API on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    // The router (and with it every audit sender) is gone once serve returns.
    let stats = writer.await.context("audit writer panicked")?;
    tracing::info!(
        written = stats.written,
        failed = stats.failed,
        "audit log flushed"
    );
    Ok(())
}
