//! Database pool creation, migrations and the shared `Store` handle.

use crate::audit::AuditLog;
use crate::config::CoreConfig;
use crate::EmrResult;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Opens a connection pool for the configured database.
///
/// Foreign keys are enforced on every connection and the database file is created if it
/// does not exist yet.
pub async fn connect(cfg: &CoreConfig) -> EmrResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(cfg.database_url())?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.max_connections())
        .connect_with(options)
        .await?;

    tracing::debug!(url = cfg.database_url(), "database pool opened");
    Ok(pool)
}

/// Applies all pending schema migrations.
pub async fn migrate(pool: &SqlitePool) -> EmrResult<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Shared handle passed to every service: the connection pool plus the audit emitter.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    audit: AuditLog,
}

impl Store {
    pub fn new(pool: SqlitePool, audit: AuditLog) -> Self {
        Self { pool, audit }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}
