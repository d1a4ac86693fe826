//! Loader configuration
//!
//! Everything environment-specific is injected here; nothing about the target
//! database lives in source. `.env` files are honoured through `dotenvy`.

use crate::db::DbConfig;
use crate::error::{IngestError, Result};

/// Default value written to the `created_by` audit columns.
pub const DEFAULT_CREATED_BY: &str = "osha-load";

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub database: DbConfig,
    /// Failure count above which a finished load exits non-zero
    pub max_failures: Option<u64>,
    pub created_by: String,
}

impl LoaderConfig {
    /// Load configuration from the environment (and `.env` if present)
    ///
    /// - `DATABASE_URL` (required), `DB_SCHEMA`, `DB_CONNECT_TIMEOUT`
    /// - `LOAD_MAX_FAILURES`: unset means unlimited
    /// - `LOAD_CREATED_BY`: defaults to [`DEFAULT_CREATED_BY`]
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database = DbConfig::from_env()?;

        let max_failures = match std::env::var("LOAD_MAX_FAILURES") {
            Ok(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
                IngestError::config(format!("LOAD_MAX_FAILURES '{raw}' is not a number"))
            })?),
            Err(_) => None,
        };

        let created_by = std::env::var("LOAD_CREATED_BY")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CREATED_BY.to_string());

        Ok(Self {
            database,
            max_failures,
            created_by,
        })
    }

    /// CLI flags win over the environment
    pub fn with_max_failures(mut self, max_failures: Option<u64>) -> Self {
        if max_failures.is_some() {
            self.max_failures = max_failures;
        }
        self
    }
}
