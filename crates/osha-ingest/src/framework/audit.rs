//! Load audit trail
//!
//! One `data_loads` row per source file: inserted as `in_progress` when the
//! file starts, finalized exactly once as `completed` or `failed`. Nothing is
//! recorded for dry runs or validate-only runs.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use super::loader::{LoadOptions, LoadStats};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    InProgress,
    Completed,
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::InProgress => "in_progress",
            LoadStatus::Completed => "completed",
            LoadStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An earlier completed load of byte-identical input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousLoad {
    pub load_id: Uuid,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Handle for one file's audit row
#[derive(Debug, Clone)]
pub struct LoadAudit {
    pub load_id: Uuid,
    pub load_type: String,
    pub source_file_name: String,
    pub source_file_hash: String,
    pub data_year: Option<i32>,
    /// False when no row was written (dry run, validate only)
    pub persisted: bool,
    pub previous: Option<PreviousLoad>,
}

pub struct LoadAuditRecorder {
    pool: PgPool,
    options: LoadOptions,
    created_by: String,
}

impl LoadAuditRecorder {
    pub fn new(pool: PgPool, options: LoadOptions, created_by: impl Into<String>) -> Self {
        Self {
            pool,
            options,
            created_by: created_by.into(),
        }
    }

    /// Fingerprint `source` and open its audit row
    pub async fn start(
        &self,
        source: &Path,
        load_type: &str,
        data_year: Option<i32>,
    ) -> Result<LoadAudit> {
        let source_file_hash = osha_common::checksum::sha256_file(source)?;
        let source_file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());

        let previous = self.find_completed(&source_file_hash, load_type).await?;
        if let Some(prev) = &previous {
            info!(
                file = %source_file_name,
                previous_load = %prev.load_id,
                "Identical file was already loaded; unchanged records will be skipped"
            );
        }

        let load_id = Uuid::new_v4();
        let persisted = self.options.persists();

        if persisted {
            sqlx::query(
                r#"
                INSERT INTO data_loads (
                    load_id, load_type, load_mode, source_file_name, source_file_path,
                    source_file_hash, data_year, load_status, created_by
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'in_progress', $8)
                "#,
            )
            .bind(load_id)
            .bind(load_type)
            .bind(self.options.mode.as_str())
            .bind(&source_file_name)
            .bind(source.display().to_string())
            .bind(&source_file_hash)
            .bind(data_year)
            .bind(&self.created_by)
            .execute(&self.pool)
            .await?;
        }

        info!(%load_id, file = %source_file_name, hash = %source_file_hash, persisted, "Load started");

        Ok(LoadAudit {
            load_id,
            load_type: load_type.to_string(),
            source_file_name,
            source_file_hash,
            data_year,
            persisted,
            previous,
        })
    }

    /// Most recent completed load of the same bytes for `load_type`
    pub async fn find_completed(
        &self,
        source_file_hash: &str,
        load_type: &str,
    ) -> Result<Option<PreviousLoad>> {
        let row: Option<(Uuid, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT load_id, completed_at
            FROM data_loads
            WHERE source_file_hash = $1 AND load_type = $2 AND load_status = 'completed'
            ORDER BY completed_at DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(source_file_hash)
        .bind(load_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(load_id, completed_at)| PreviousLoad {
            load_id,
            completed_at,
        }))
    }

    /// Finalize the audit row; later calls for the same row are no-ops
    pub async fn finish(
        &self,
        audit: &LoadAudit,
        status: LoadStatus,
        stats: &LoadStats,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !audit.persisted {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE data_loads SET
                load_status = $2,
                records_loaded = $3,
                records_updated = $4,
                records_skipped = $5,
                records_failed = $6,
                error_message = $7,
                completed_at = NOW()
            WHERE load_id = $1 AND load_status = 'in_progress'
            "#,
        )
        .bind(audit.load_id)
        .bind(status.as_str())
        .bind(to_i64(stats.loaded()))
        .bind(to_i64(stats.updated))
        .bind(to_i64(stats.skipped))
        .bind(to_i64(stats.failed))
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(load_id = %audit.load_id, "Audit row already finalized");
        } else {
            info!(load_id = %audit.load_id, %status, "Load finalized");
        }
        Ok(())
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
