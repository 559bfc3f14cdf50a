//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services.
//! Request handling never reads process-wide environment variables.

use crate::constants::{DEFAULT_DATABASE_URL, DEFAULT_MAX_CONNECTIONS};
use crate::{EmrError, EmrResult};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    database_url: String,
    max_connections: u32,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    pub fn new(database_url: String, max_connections: u32) -> EmrResult<Self> {
        if database_url.trim().is_empty() {
            return Err(EmrError::InvalidInput("database_url cannot be empty".into()));
        }
        if max_connections == 0 {
            return Err(EmrError::InvalidInput(
                "max_connections must be at least 1".into(),
            ));
        }

        Ok(Self {
            database_url,
            max_connections,
        })
    }

    /// Build a configuration from optional raw values (typically environment variables).
    ///
    /// Missing or blank values fall back to the crate defaults.
    pub fn from_env_values(
        database_url: Option<String>,
        max_connections: Option<String>,
    ) -> EmrResult<Self> {
        let database_url = database_url
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.into());

        let max_connections = match max_connections
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                EmrError::InvalidInput(format!("invalid EMR_DB_MAX_CONNECTIONS value: {raw}"))
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Self::new(database_url, max_connections)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_values_uses_defaults() {
        let cfg = CoreConfig::from_env_values(None, Some("  ".into())).unwrap();
        assert_eq!(cfg.database_url(), DEFAULT_DATABASE_URL);
        assert_eq!(cfg.max_connections(), DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn from_env_values_rejects_bad_pool_size() {
        let err = CoreConfig::from_env_values(None, Some("lots".into()))
            .expect_err("non-numeric pool size should fail");
        assert!(matches!(err, EmrError::InvalidInput(_)));

        let err = CoreConfig::from_env_values(None, Some("0".into()))
            .expect_err("zero pool size should fail");
        assert!(matches!(err, EmrError::InvalidInput(_)));
    }
}
