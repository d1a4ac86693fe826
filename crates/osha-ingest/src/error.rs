//! Error taxonomy for the loaders
//!
//! Every failure falls into one of three classes, which decides how the
//! loader driver reacts:
//!
//! - **structural**: the input cannot be processed at all (unreadable file,
//!   missing required section). Raised before any write.
//! - **per-record**: a single document failed to map or write. Its
//!   transaction is rolled back, the failure is counted and the load moves on.
//! - **connectivity**: the database session is gone. The load aborts.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid input structure in {origin}: {message}")]
    Structural { origin: String, message: String },

    #[error("Database connectivity error: {0}")]
    Connectivity(String),

    #[error("Record '{key}' rejected: {message}")]
    Record { key: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Excel error: {0}")]
    Excel(#[from] calamine::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] osha_common::CommonError),
}

impl IngestError {
    pub fn structural(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Structural {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn record(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Record {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True when the database session itself is unusable
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Connectivity(_) => true,
            Self::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// True when the whole load must stop instead of skipping one record
    pub fn is_fatal(&self) -> bool {
        self.is_connectivity()
            || matches!(
                self,
                Self::Structural { .. } | Self::Config(_) | Self::Migration(_) | Self::Common(_)
            )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_errors_are_not_fatal() {
        let err = IngestError::record("29-CFR-1926-Subpart-M", "rule_id missing");
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("29-CFR-1926-Subpart-M"));
    }

    #[test]
    fn test_constraint_violation_is_per_record() {
        let err = IngestError::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_connectivity());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_pool_failures_are_connectivity() {
        assert!(IngestError::Database(sqlx::Error::PoolTimedOut).is_fatal());
        assert!(IngestError::Database(sqlx::Error::PoolClosed).is_connectivity());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(IngestError::Database(sqlx::Error::Io(io)).is_connectivity());
    }

    #[test]
    fn test_structural_errors_are_fatal() {
        let err = IngestError::structural("ita_2024.csv", "no header row");
        assert!(err.is_fatal());
        assert!(!err.is_connectivity());
    }
}
