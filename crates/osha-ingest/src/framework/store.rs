//! Versioned storage
//!
//! [`VersionStore`] is the seam between the loader driver and persistence.
//! [`PgVersionStore`] implements it once for every versioned table: the
//! generic parts (resolve, demote, transaction, rollback on dry run) live
//! here and the table-specific column mapping is delegated to a
//! [`RecordMapper`].
//!
//! Every versioned table carries `id BIGSERIAL`, `logical_key`,
//! `content_hash`, `is_current`, `created_at` and `updated_at`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use super::hash::compute_content_hash;
use super::mode::{Action, ExistingVersion};
use crate::error::Result;

/// One parsed input unit ready to be versioned
#[derive(Debug, Clone)]
pub struct Document<T> {
    pub logical_key: String,
    pub content_hash: String,
    pub record: T,
}

impl<T> Document<T> {
    /// Hash `raw` (the document as read) and pair it with its typed form
    pub fn new(logical_key: impl Into<String>, raw: &Value, record: T) -> Self {
        Self {
            logical_key: logical_key.into(),
            content_hash: compute_content_hash(raw),
            record,
        }
    }
}

/// Result of applying one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub record_id: i64,
    /// Parent, demoted and child rows touched
    pub rows_affected: u64,
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    type Record: Send + Sync;

    /// Versioned table this store writes
    fn table(&self) -> &'static str;

    /// Empty the store's tables
    async fn truncate(&self) -> Result<()>;

    /// Most recent row for `logical_key`, current rows first
    async fn resolve_existing(&self, logical_key: &str) -> Result<Option<ExistingVersion>>;

    /// Apply `action` for `doc` in one transaction
    ///
    /// With `commit == false` every statement still runs and the transaction
    /// is rolled back at the end.
    async fn apply(
        &self,
        action: Action,
        doc: &Document<Self::Record>,
        commit: bool,
    ) -> Result<ApplyOutcome>;
}

/// Column mapping for one versioned table and its child tables
///
/// All methods receive the connection of the document's transaction.
#[async_trait]
pub trait RecordMapper: Send + Sync {
    type Record: Send + Sync;

    fn table(&self) -> &'static str;

    /// Tables emptied by `truncate_load`; child tables follow via CASCADE
    fn truncate_tables(&self) -> Vec<&'static str> {
        vec![self.table()]
    }

    /// Insert a new current row and return its id
    async fn insert_version(
        &self,
        conn: &mut PgConnection,
        doc: &Document<Self::Record>,
    ) -> Result<i64>;

    /// Overwrite row `id` with `doc`, marking it current
    async fn update_version(
        &self,
        conn: &mut PgConnection,
        id: i64,
        doc: &Document<Self::Record>,
    ) -> Result<()>;

    /// Write child rows for parent `id`, returning how many were written
    async fn write_children(
        &self,
        _conn: &mut PgConnection,
        _id: i64,
        _doc: &Document<Self::Record>,
    ) -> Result<u64> {
        Ok(0)
    }

    /// Remove child rows of parent `id` before they are rewritten
    async fn delete_children(&self, _conn: &mut PgConnection, _id: i64) -> Result<u64> {
        Ok(0)
    }
}

/// PostgreSQL-backed store for any [`RecordMapper`]
pub struct PgVersionStore<M> {
    pool: PgPool,
    mapper: M,
}

impl<M: RecordMapper> PgVersionStore<M> {
    pub fn new(pool: PgPool, mapper: M) -> Self {
        Self { pool, mapper }
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    async fn demote_current(
        &self,
        conn: &mut PgConnection,
        logical_key: &str,
        keep_id: Option<i64>,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET is_current = FALSE, updated_at = NOW() \
             WHERE logical_key = $1 AND is_current AND id IS DISTINCT FROM $2",
            self.mapper.table()
        );
        let result = sqlx::query(&sql)
            .bind(logical_key)
            .bind(keep_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl<M: RecordMapper> VersionStore for PgVersionStore<M> {
    type Record = M::Record;

    fn table(&self) -> &'static str {
        self.mapper.table()
    }

    async fn truncate(&self) -> Result<()> {
        let tables = self.mapper.truncate_tables().join(", ");
        let sql = format!("TRUNCATE TABLE {tables} CASCADE");
        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await?;
        tracing::info!(%tables, "Truncated tables");
        Ok(())
    }

    async fn resolve_existing(&self, logical_key: &str) -> Result<Option<ExistingVersion>> {
        let sql = format!(
            "SELECT id, content_hash, is_current FROM {} \
             WHERE logical_key = $1 ORDER BY is_current DESC, id DESC LIMIT 1",
            self.mapper.table()
        );
        let row: Option<(i64, String, bool)> = sqlx::query_as(&sql)
            .bind(logical_key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, content_hash, is_current)| ExistingVersion {
            id,
            content_hash,
            is_current,
        }))
    }

    async fn apply(
        &self,
        action: Action,
        doc: &Document<Self::Record>,
        commit: bool,
    ) -> Result<ApplyOutcome> {
        if let Action::Skip { id } = action {
            return Ok(ApplyOutcome {
                record_id: id,
                rows_affected: 0,
            });
        }

        let mut tx = self.pool.begin().await?;

        let outcome = match action {
            Action::InsertNewVersion { .. } => {
                let demoted = self.demote_current(&mut tx, &doc.logical_key, None).await?;
                let id = self.mapper.insert_version(&mut tx, doc).await?;
                let children = self.mapper.write_children(&mut tx, id, doc).await?;
                ApplyOutcome {
                    record_id: id,
                    rows_affected: 1 + demoted + children,
                }
            },
            Action::UpdateInPlace { id } => {
                let demoted = self.demote_current(&mut tx, &doc.logical_key, Some(id)).await?;
                self.mapper.update_version(&mut tx, id, doc).await?;
                let removed = self.mapper.delete_children(&mut tx, id).await?;
                let children = self.mapper.write_children(&mut tx, id, doc).await?;
                ApplyOutcome {
                    record_id: id,
                    rows_affected: 1 + demoted + removed + children,
                }
            },
            Action::Skip { id } => ApplyOutcome {
                record_id: id,
                rows_affected: 0,
            },
        };

        if commit {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
            debug!(key = %doc.logical_key, "Dry run: transaction rolled back");
        }

        Ok(outcome)
    }
}
