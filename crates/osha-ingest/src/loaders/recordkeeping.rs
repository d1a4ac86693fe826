//! Recordkeeping loader
//!
//! The 29 CFR 1904 recordkeeping rules arrive as one large JSON document that
//! is stored whole as JSONB in `regulation_documents`, alongside a few section
//! counts used for quick inspection.
//!
//! Documents are keyed by regulation id and parsing version. Only the most
//! recently written parse of a regulation is current, which is what the
//! `get_current_regulation` and `check_company_applicability` SQL functions
//! read.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgConnection;
use std::path::Path;

use super::{
    demote_other_current, opt_text, require_fields, run_json, text, LoadContext, LoaderRun, Parsed,
};
use crate::coerce::{coerce_date, coerce_string, coerce_timestamp};
use crate::error::{IngestError, Result};
use crate::framework::{Document, RecordMapper};

pub const LOAD_TYPE: &str = "recordkeeping";

pub const DEFAULT_PARSING_VERSION: &str = "v1.0";

pub const REQUIRED_SECTIONS: [&str; 7] = [
    "regulation_metadata",
    "company_applicability",
    "recording_criteria",
    "form_requirements",
    "ongoing_obligations",
    "government_reporting",
    "reference_data",
];

#[derive(Debug, Clone, Deserialize)]
pub struct RegulationMetadata {
    #[serde(deserialize_with = "text")]
    pub regulation_id: String,
    pub effective_date: Value,
    #[serde(default, deserialize_with = "opt_text")]
    pub parsing_version: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub last_updated: Option<Value>,
}

/// Sizes of the main sections, stored next to the document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SectionCounts {
    pub naics_codes: usize,
    pub decision_tree_steps: usize,
    pub required_forms: usize,
    pub definitions: usize,
}

impl SectionCounts {
    pub fn from_document(doc: &Value) -> Self {
        let len = |v: Option<&Value>| match v {
            Some(Value::Array(items)) => items.len(),
            Some(Value::Object(map)) => map.len(),
            _ => 0,
        };

        let naics_codes = doc
            .pointer("/company_applicability/industry_exemptions")
            .and_then(Value::as_array)
            .map(|exemptions| exemptions.iter().map(|e| len(e.get("naics_codes"))).sum())
            .unwrap_or(0);

        Self {
            naics_codes,
            decision_tree_steps: len(doc.pointer("/recording_criteria/recordability_decision_tree/decision_path")),
            required_forms: len(doc.pointer("/form_requirements/required_forms")),
            definitions: len(doc.pointer("/reference_data/definitions")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordkeepingDocument {
    pub regulation_id: String,
    pub version: String,
    pub effective_date: NaiveDate,
    pub source_url: Option<String>,
    pub last_updated: Option<chrono::NaiveDateTime>,
    pub counts: SectionCounts,
    pub content: Value,
}

impl RecordkeepingDocument {
    fn from_raw(raw: &Value, key: &str) -> Result<Self> {
        let metadata = RegulationMetadata::deserialize(&raw["regulation_metadata"])
            .map_err(|e| IngestError::record(key, format!("regulation_metadata: {e}")))?;
        let effective_date = coerce_date(Some(&metadata.effective_date)).ok_or_else(|| {
            IngestError::record(key, format!("unreadable effective_date {}", metadata.effective_date))
        })?;

        Ok(Self {
            regulation_id: metadata.regulation_id,
            version: metadata
                .parsing_version
                .unwrap_or_else(|| DEFAULT_PARSING_VERSION.to_string()),
            effective_date,
            source_url: metadata.source_url,
            last_updated: coerce_timestamp(metadata.last_updated.as_ref()),
            counts: SectionCounts::from_document(raw),
            content: raw.clone(),
        })
    }
}

/// `{regulation_id}:{parsing_version}`
pub fn document_key(regulation_id: &str, version: &str) -> String {
    format!("{regulation_id}:{version}")
}

/// Validate one recordkeeping file
pub fn parse(raw: Value, origin: &str) -> Result<Vec<Parsed<RecordkeepingDocument>>> {
    require_fields(&raw, &REQUIRED_SECTIONS, origin, "document")?;
    require_fields(
        &raw["regulation_metadata"],
        &["regulation_id", "effective_date"],
        origin,
        "regulation_metadata",
    )?;

    let metadata = &raw["regulation_metadata"];
    let regulation_id = coerce_string(metadata.get("regulation_id"))
        .ok_or_else(|| IngestError::structural(origin, "regulation_id is not a scalar"))?;
    let version = coerce_string(metadata.get("parsing_version"))
        .unwrap_or_else(|| DEFAULT_PARSING_VERSION.to_string());
    let key = document_key(&regulation_id, &version);

    let parsed = match RecordkeepingDocument::from_raw(&raw, &key) {
        Ok(record) => Parsed::Ready(Document::new(key, &raw, record)),
        Err(error) => Parsed::Rejected { key, error },
    };
    Ok(vec![parsed])
}

pub async fn run(ctx: &mut LoadContext, path: &Path) -> Result<LoaderRun> {
    let mapper = RecordkeepingMapper::new(&ctx.created_by);
    run_json(ctx, path, LOAD_TYPE, mapper, parse).await
}

pub struct RecordkeepingMapper {
    created_by: String,
}

impl RecordkeepingMapper {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
        }
    }
}

#[async_trait]
impl RecordMapper for RecordkeepingMapper {
    type Record = RecordkeepingDocument;

    fn table(&self) -> &'static str {
        "regulation_documents"
    }

    async fn insert_version(
        &self,
        conn: &mut PgConnection,
        doc: &Document<RecordkeepingDocument>,
    ) -> Result<i64> {
        let record = &doc.record;
        demote_other_current(conn, self.table(), "regulation_id", &record.regulation_id, None).await?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO regulation_documents (
                logical_key, content_hash, is_current, regulation_id, version, effective_date,
                last_updated, parsing_date, source_url, section_counts, content, created_by
            ) VALUES ($1, $2, TRUE, $3, $4, $5, $6, NOW(), $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&doc.logical_key)
        .bind(&doc.content_hash)
        .bind(&record.regulation_id)
        .bind(&record.version)
        .bind(record.effective_date)
        .bind(record.last_updated)
        .bind(&record.source_url)
        .bind(sqlx::types::Json(record.counts))
        .bind(&record.content)
        .bind(&self.created_by)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn update_version(
        &self,
        conn: &mut PgConnection,
        id: i64,
        doc: &Document<RecordkeepingDocument>,
    ) -> Result<()> {
        let record = &doc.record;
        demote_other_current(conn, self.table(), "regulation_id", &record.regulation_id, Some(id)).await?;
        let result = sqlx::query(
            r#"
            UPDATE regulation_documents SET
                content_hash = $2, is_current = TRUE, version = $3, effective_date = $4,
                last_updated = $5, parsing_date = NOW(), source_url = $6,
                section_counts = $7, content = $8, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&doc.content_hash)
        .bind(&record.version)
        .bind(record.effective_date)
        .bind(record.last_updated)
        .bind(&record.source_url)
        .bind(sqlx::types::Json(record.counts))
        .bind(&record.content)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::record(&doc.logical_key, format!("document row {id} no longer exists")));
        }
        Ok(())
    }
}
