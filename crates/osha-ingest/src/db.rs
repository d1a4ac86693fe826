//! Database session management
//!
//! A load runs over one long-lived PostgreSQL session: the pool is capped at a
//! single connection, opened before the first document and closed on every
//! exit path by the caller.

use crate::error::{IngestError, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Embedded schema migrations from the workspace `migrations/` directory.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    /// Schema placed first on the session `search_path`
    pub schema: Option<String>,
    pub connect_timeout_secs: u64,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Read `DATABASE_URL`, `DB_SCHEMA` and `DB_CONNECT_TIMEOUT`
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| IngestError::config("DATABASE_URL not set"))?;

        let schema = std::env::var("DB_SCHEMA")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let connect_timeout_secs = std::env::var("DB_CONNECT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        let config = Self {
            url,
            schema,
            connect_timeout_secs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(IngestError::config("DATABASE_URL is empty"));
        }

        if let Some(schema) = &self.schema {
            if !is_valid_identifier(schema) {
                return Err(IngestError::config(format!(
                    "DB_SCHEMA '{schema}' is not a plain SQL identifier"
                )));
            }
        }

        if self.connect_timeout_secs == 0 {
            return Err(IngestError::config("DB_CONNECT_TIMEOUT must be greater than 0"));
        }

        Ok(())
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Open the single-session pool used by a load
///
/// Any failure here is a connectivity error: nothing has been written yet.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let mut options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| IngestError::Connectivity(format!("invalid DATABASE_URL: {e}")))?;

    if let Some(schema) = &config.schema {
        options = options.options([("search_path", schema.as_str())]);
    }

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect_with(options)
        .await
        .map_err(|e| IngestError::Connectivity(e.to_string()))?;

    health_check(&pool).await?;

    tracing::info!(schema = ?config.schema, "Database session opened");
    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| IngestError::Connectivity(e.to_string()))
}

/// Apply pending schema migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    tracing::info!("Schema migrations applied");
    Ok(())
}
