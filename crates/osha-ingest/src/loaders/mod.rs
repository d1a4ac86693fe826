//! Concrete loaders
//!
//! Each loader parses its input files up front (so a structural problem in
//! any file stops the run before the first write), then drives the parsed
//! documents through one [`VersionedLoader`](crate::framework::VersionedLoader)
//! per table with a `data_loads` audit row per source file.

pub mod cfr_1904;
pub mod cfr_content;
pub mod companies;
pub mod ita;
pub mod recordkeeping;
pub mod regulation;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::path::{Path, PathBuf};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::coerce::{coerce_array, coerce_string};
use crate::error::{IngestError, Result};
use crate::framework::audit::PreviousLoad;
use crate::framework::{
    Document, LoadAudit, LoadAuditRecorder, LoadOptions, LoadStats, LoadStatus, PgVersionStore,
    RecordMapper, VersionStore, VersionedLoader,
};
use crate::source::{collect_source_files, read_json, JSON_EXTENSIONS};

/// Everything a loader needs besides its input path
pub struct LoadContext {
    pub pool: PgPool,
    pub options: LoadOptions,
    pub created_by: String,
    pub max_failures: Option<u64>,
    audit: LoadAuditRecorder,
    failures_so_far: u64,
}

impl LoadContext {
    pub fn new(
        pool: PgPool,
        options: LoadOptions,
        created_by: impl Into<String>,
        max_failures: Option<u64>,
    ) -> Self {
        let created_by = created_by.into();
        Self {
            audit: LoadAuditRecorder::new(pool.clone(), options, created_by.clone()),
            pool,
            options,
            created_by,
            max_failures,
            failures_so_far: 0,
        }
    }

    pub fn audit(&self) -> &LoadAuditRecorder {
        &self.audit
    }

    /// Open the audit row for one source file
    pub async fn start_file(
        &self,
        source: &Path,
        load_type: &str,
        data_year: Option<i32>,
    ) -> Result<LoadAudit> {
        self.audit.start(source, load_type, data_year).await
    }

    /// Finalize a file's audit row from the outcome of loading it
    ///
    /// A fatal `outcome` marks the row failed and is handed back. A completed
    /// file whose failures push the run past `max_failures` is marked failed
    /// too, but the run continues so the report covers every file.
    pub async fn finish_file(
        &mut self,
        audit: &LoadAudit,
        source: &Path,
        outcome: Result<()>,
        tables: Vec<LoadStats>,
    ) -> Result<FileOutcome> {
        let stats = LoadStats::total(&audit.load_type, &tables);

        if let Err(err) = outcome {
            let message = err.to_string();
            if let Err(finish_err) = self
                .audit
                .finish(audit, LoadStatus::Failed, &stats, Some(&message))
                .await
            {
                error!(load_id = %audit.load_id, error = %finish_err, "Could not finalize audit row");
            }
            return Err(err);
        }

        self.failures_so_far += stats.failed;
        let (status, message) = match self.max_failures {
            Some(max) if self.failures_so_far > max => {
                let message = format!(
                    "failure threshold exceeded: {} failed records (max {max})",
                    self.failures_so_far
                );
                warn!(load_id = %audit.load_id, "{message}");
                (LoadStatus::Failed, Some(message))
            },
            _ => (LoadStatus::Completed, None),
        };

        self.audit
            .finish(audit, status, &stats, message.as_deref())
            .await?;

        Ok(FileOutcome {
            source: source.to_path_buf(),
            load_id: audit.persisted.then_some(audit.load_id),
            status,
            previous: audit.previous.clone(),
            stats,
        })
    }
}

/// Per-file result shown in the summary report
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub source: PathBuf,
    /// `None` when no audit row was written
    pub load_id: Option<Uuid>,
    pub status: LoadStatus,
    pub previous: Option<PreviousLoad>,
    pub stats: LoadStats,
}

/// Result of one loader run
#[derive(Debug, Clone, Default)]
pub struct LoaderRun {
    pub tables: Vec<LoadStats>,
    pub files: Vec<FileOutcome>,
    pub notes: Vec<String>,
}

/// A parsed input unit, or the reason it cannot be loaded
///
/// Rejections are per-record failures: they are counted and the remaining
/// documents still load.
#[derive(Debug)]
pub enum Parsed<T> {
    Ready(Document<T>),
    Rejected { key: String, error: IngestError },
}

impl<T> Parsed<T> {
    /// Parse `raw` into `T`, rejecting the document on a schema mismatch
    pub fn from_raw(key: String, raw: &Value) -> Self
    where
        T: DeserializeOwned,
    {
        match T::deserialize(raw) {
            Ok(record) => Parsed::Ready(Document::new(key, raw, record)),
            Err(err) => Parsed::Rejected {
                error: IngestError::record(&key, format!("schema mismatch: {err}")),
                key,
            },
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Parsed::Ready(doc) => &doc.logical_key,
            Parsed::Rejected { key, .. } => key,
        }
    }
}

/// A typed value together with the JSON it was read from
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub raw: Value,
    pub parsed: T,
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Sourced<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let parsed = T::deserialize(&raw).map_err(serde::de::Error::custom)?;
        Ok(Self { raw, parsed })
    }
}

impl<T> std::ops::Deref for Sourced<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.parsed
    }
}

pub(crate) async fn load_parsed<S: VersionStore>(
    loader: &mut VersionedLoader<S>,
    parsed: Parsed<S::Record>,
) -> Result<()> {
    match parsed {
        Parsed::Ready(doc) => loader.load_document(doc).await.map(|_| ()),
        Parsed::Rejected { key, error } => loader.reject(&key, error),
    }
}

/// Shared driver for the JSON document loaders
///
/// Every file under `path` is read and parsed before anything is written.
pub(crate) async fn run_json<M, F>(
    ctx: &mut LoadContext,
    path: &Path,
    load_type: &str,
    mapper: M,
    parse: F,
) -> Result<LoaderRun>
where
    M: RecordMapper,
    F: Fn(Value, &str) -> Result<Vec<Parsed<M::Record>>>,
{
    let files = collect_source_files(path, true, &JSON_EXTENSIONS)?;
    let mut batches = Vec::with_capacity(files.len());
    for file in files {
        let origin = file.display().to_string();
        let documents = parse(read_json(&file)?, &origin)?;
        batches.push((file, documents));
    }
    info!(load_type, files = batches.len(), "Input validated");

    let mut loader = VersionedLoader::new(PgVersionStore::new(ctx.pool.clone(), mapper), ctx.options);
    loader.prepare().await?;
    let mut run = LoaderRun::default();

    for (file, documents) in batches {
        let audit = ctx.start_file(&file, load_type, None).await?;
        let span = info_span!("load", load_type, file = %audit.source_file_name, load_id = %audit.load_id);
        let outcome = async {
            for parsed in documents {
                load_parsed(&mut loader, parsed).await?;
            }
            Ok::<_, IngestError>(())
        }
        .instrument(span)
        .await;
        let stats = vec![loader.finish_file()];
        run.files.push(ctx.finish_file(&audit, &file, outcome, stats).await?);
    }

    run.tables.push(loader.into_stats());
    Ok(run)
}

/// Clear `is_current` on rows of `table` sharing `column = value`, except `keep`
///
/// For tables whose logical key is finer than the unit that may have only
/// one current row (a regulation parsed under several versions).
pub(crate) async fn demote_other_current(
    conn: &mut PgConnection,
    table: &str,
    column: &str,
    value: &str,
    keep: Option<i64>,
) -> Result<u64> {
    let sql = format!(
        "UPDATE {table} SET is_current = FALSE, updated_at = NOW() \
         WHERE {column} = $1 AND is_current AND id IS DISTINCT FROM $2"
    );
    let result = sqlx::query(&sql).bind(value).bind(keep).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Require `fields` on the object `value`, naming the first one missing
pub(crate) fn require_fields(value: &Value, fields: &[&str], origin: &str, context: &str) -> Result<()> {
    let Some(object) = value.as_object() else {
        return Err(IngestError::structural(origin, format!("{context} is not an object")));
    };
    let missing: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| object.get(*f).map_or(true, Value::is_null))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(IngestError::structural(
            origin,
            format!("{context} is missing required field(s): {}", missing.join(", ")),
        ))
    }
}

/// Free text that may arrive as a string, number or list of strings
pub(crate) fn joined_text(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::Array(_)) => {
            let items = coerce_array(value);
            (!items.is_empty()).then(|| items.join("; "))
        },
        other => coerce_string(other),
    }
}

/// Deserialize a scalar that may be written as a string or a number
pub(crate) fn text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    coerce_string(Some(&value))
        .ok_or_else(|| serde::de::Error::custom(format!("expected text, found {value}")))
}

pub(crate) fn opt_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(|v| coerce_string(Some(v))))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Header {
        #[serde(deserialize_with = "text")]
        part: String,
        #[serde(default, deserialize_with = "opt_text")]
        subpart: Option<String>,
    }

    #[test]
    fn test_require_fields_names_missing() {
        let value = json!({ "part": "1926", "title": null });
        let err = require_fields(&value, &["part", "subpart", "title"], "m.json", "regulation")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("subpart, title"), "{message}");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_require_fields_non_object() {
        assert!(require_fields(&json!([1]), &["part"], "m.json", "regulation").is_err());
    }

    #[test]
    fn test_numeric_scalars_deserialize_as_text() {
        let header: Header = serde_json::from_value(json!({ "part": 1926, "subpart": "M" })).unwrap();
        assert_eq!(header.part, "1926");
        assert_eq!(header.subpart.as_deref(), Some("M"));

        let header: Header = serde_json::from_value(json!({ "part": "1910" })).unwrap();
        assert!(header.subpart.is_none());

        assert!(serde_json::from_value::<Header>(json!({ "part": {} })).is_err());
    }

    #[test]
    fn test_joined_text() {
        assert_eq!(
            joined_text(Some(&json!(["construction", " general industry "]))).as_deref(),
            Some("construction; general industry")
        );
        assert_eq!(joined_text(Some(&json!("all employers"))).as_deref(), Some("all employers"));
        assert_eq!(joined_text(Some(&json!([]))), None);
        assert_eq!(joined_text(None), None);
    }
}
