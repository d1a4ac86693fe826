//! CFR content loader
//!
//! A content file holds the extracted items (definitions, training,
//! procedures, references, appendices) of one CFR citation. Every item is its
//! own versioned row in `cfr_content`, attached to the citation's regulation
//! row, which is created on first sight. Type-specific details are child rows.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgConnection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{
    joined_text, opt_text, require_fields, run_json, text, LoadContext, LoaderRun, Parsed, Sourced,
};
use crate::coerce::{coerce_array, coerce_date, coerce_i32, coerce_string};
use crate::error::{IngestError, Result};
use crate::framework::{compute_content_hash, Document, RecordMapper};

pub const LOAD_TYPE: &str = "cfr_content";

const DEFAULT_TITLE_NUMBER: i32 = 29;

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentMetadata {
    #[serde(deserialize_with = "text")]
    pub cfr_citation: String,
    #[serde(default, deserialize_with = "opt_text")]
    pub title: Option<String>,
    #[serde(default)]
    pub authority: Option<Value>,
    #[serde(default)]
    pub effective_date: Option<Value>,
    #[serde(default)]
    pub last_updated: Option<Value>,
    #[serde(default)]
    pub applies_to: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Definition,
    Training,
    Procedure,
    Reference,
    Appendix,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Definition => "definition",
            ContentType::Training => "training",
            ContentType::Procedure => "procedure",
            ContentType::Reference => "reference",
            ContentType::Appendix => "appendix",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceLocation {
    #[serde(default, deserialize_with = "opt_text")]
    pub section: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub subsection: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub paragraph: Option<String>,
    #[serde(default)]
    pub page_number: Option<Value>,
    #[serde(default, deserialize_with = "opt_text")]
    pub line_reference: Option<String>,
}

impl SourceLocation {
    /// Section and subsection joined, e.g. `1910.1200(h)`
    pub fn content_code(&self) -> Option<String> {
        let section = self.section.as_deref()?;
        Some(format!("{section}{}", self.subsection.as_deref().unwrap_or_default()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentBody {
    #[serde(default, deserialize_with = "opt_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrainingDetails {
    #[serde(default, deserialize_with = "opt_text")]
    pub frequency: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub scope: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub trainer_requirements: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub audience: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub quality_benchmark: Option<String>,
    #[serde(default)]
    pub example_institutions: Option<Value>,
    #[serde(default)]
    pub industry_specific: Option<Value>,
    #[serde(default, deserialize_with = "opt_text")]
    pub trigger: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub performance_standard: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferenceDetails {
    #[serde(default, deserialize_with = "opt_text")]
    pub standard_id: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub organization: Option<String>,
    #[serde(default)]
    pub publication_year: Option<Value>,
    #[serde(default, deserialize_with = "opt_text")]
    pub purpose: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub incorporation_method: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub publication_title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppendixDetails {
    #[serde(default, rename = "type", deserialize_with = "opt_text")]
    pub appendix_type: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub purpose: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub scope: Option<String>,
    #[serde(default)]
    pub content_areas: Option<Value>,
    #[serde(default)]
    pub organizations: Option<Value>,
    #[serde(default)]
    pub coverage: Option<Value>,
    #[serde(default)]
    pub test_methods: Option<Value>,
    #[serde(default)]
    pub includes: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentItem {
    pub content_type: ContentType,
    #[serde(default)]
    pub source_location: Option<Sourced<SourceLocation>>,
    #[serde(default)]
    pub hierarchy_path: Option<Value>,
    #[serde(default)]
    pub content: ContentBody,
    #[serde(default)]
    pub cross_references: Option<Value>,
    #[serde(default)]
    pub related_terms: Option<Value>,
    #[serde(default)]
    pub training_details: Option<TrainingDetails>,
    #[serde(default)]
    pub procedure_steps: Option<Value>,
    #[serde(default)]
    pub required_elements: Option<Value>,
    #[serde(default)]
    pub reference_details: Option<ReferenceDetails>,
    #[serde(default)]
    pub appendix_details: Option<AppendixDetails>,
}

impl ContentItem {
    fn location(&self) -> SourceLocation {
        self.source_location
            .as_ref()
            .map(|s| s.parsed.clone())
            .unwrap_or_default()
    }
}

/// One content item with the metadata of the file it came from
#[derive(Debug, Clone)]
pub struct CfrItem {
    pub metadata: Arc<Sourced<DocumentMetadata>>,
    pub item: Sourced<ContentItem>,
}

/// Title number, part and subpart from a citation like `29 CFR 1910 Subpart Z`
pub fn parse_citation(citation: &str) -> (i32, String, String) {
    let parts: Vec<&str> = citation.split_whitespace().collect();
    if parts.len() < 4 {
        return (DEFAULT_TITLE_NUMBER, String::new(), String::new());
    }
    let title = parts[0].parse::<i32>().unwrap_or(DEFAULT_TITLE_NUMBER);
    (title, parts[2].to_string(), parts[3..].join(" "))
}

/// Hex digits of an item fingerprint used in fallback keys
const FINGERPRINT_LEN: usize = 12;

/// Short hash of an item's title and text, or of the whole item when it has
/// neither
pub fn item_fingerprint(item: &Value) -> String {
    let title = item.pointer("/content/title").filter(|v| !v.is_null());
    let text = item.pointer("/content/text").filter(|v| !v.is_null());
    let mut hash = if title.is_none() && text.is_none() {
        compute_content_hash(item)
    } else {
        compute_content_hash(&json!({ "title": title, "text": text }))
    };
    hash.truncate(FINGERPRINT_LEN);
    hash
}

fn location_code(item: &Value) -> Option<String> {
    let section = coerce_string(item.pointer("/source_location/section"))?;
    let subsection = coerce_string(item.pointer("/source_location/subsection"));
    Some(format!("{section}{}", subsection.unwrap_or_default()))
}

/// Validate one content file and split it into per-item documents
///
/// An item is keyed by its section and subsection. Items without a section
/// use `item-{fingerprint}`, and items sharing a location all get a
/// `#{fingerprint}` suffix, so keys do not depend on item order.
pub fn parse(raw: Value, origin: &str) -> Result<Vec<Parsed<CfrItem>>> {
    require_fields(&raw, &["document_metadata", "extracted_content"], origin, "document")?;
    require_fields(&raw["document_metadata"], &["cfr_citation"], origin, "document_metadata")?;

    let metadata = Sourced::<DocumentMetadata>::deserialize(&raw["document_metadata"])
        .map_err(|e| IngestError::structural(origin, format!("document_metadata: {e}")))?;
    let metadata = Arc::new(metadata);
    let Some(items) = raw["extracted_content"].as_array() else {
        return Err(IngestError::structural(origin, "extracted_content is not a list"));
    };

    let codes: Vec<Option<String>> = items.iter().map(location_code).collect();
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for code in codes.iter().flatten() {
        *occurrences.entry(code.as_str()).or_insert(0) += 1;
    }

    let mut documents = Vec::with_capacity(items.len());
    for (index, (item, code)) in items.iter().zip(&codes).enumerate() {
        let code = match code {
            Some(code) if occurrences.get(code.as_str()).copied().unwrap_or(0) > 1 => {
                format!("{code}#{}", item_fingerprint(item))
            },
            Some(code) => code.clone(),
            None => format!("item-{}", item_fingerprint(item)),
        };
        let key = format!("{}:{code}", metadata.cfr_citation);

        let parsed = match Sourced::<ContentItem>::deserialize(item) {
            Ok(content) => Parsed::Ready(Document::new(
                key,
                item,
                CfrItem {
                    metadata: Arc::clone(&metadata),
                    item: content,
                },
            )),
            Err(err) => Parsed::Rejected {
                error: IngestError::record(&key, format!("content item {}: {err}", index + 1)),
                key,
            },
        };
        documents.push(parsed);
    }

    Ok(documents)
}

pub async fn run(ctx: &mut LoadContext, path: &Path) -> Result<LoaderRun> {
    let mapper = CfrContentMapper::new(&ctx.created_by);
    run_json(ctx, path, LOAD_TYPE, mapper, parse).await
}

pub struct CfrContentMapper {
    created_by: String,
}

impl CfrContentMapper {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
        }
    }

    /// Current regulation row for the citation, created if missing
    async fn regulation_id(&self, conn: &mut PgConnection, metadata: &Sourced<DocumentMetadata>) -> Result<i64> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM regulations WHERE logical_key = $1 AND is_current")
                .bind(&metadata.cfr_citation)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }

        let (title_number, part, subpart) = parse_citation(&metadata.cfr_citation);
        let title = metadata
            .title
            .clone()
            .unwrap_or_else(|| metadata.cfr_citation.clone());
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO regulations (
                logical_key, content_hash, is_current, title_number, title, part, subpart,
                section_title, authority, effective_date, last_updated, applies_to, excludes,
                source_data, created_by, updated_by
            ) VALUES ($1, $2, TRUE, $3, $4, $5, $6, $4, $7, $8, $9, $10, '{}', $11, $12, $12)
            RETURNING id
            "#,
        )
        .bind(&metadata.cfr_citation)
        .bind(compute_content_hash(&metadata.raw))
        .bind(title_number)
        .bind(&title)
        .bind(&part)
        .bind(&subpart)
        .bind(joined_text(metadata.authority.as_ref()))
        .bind(coerce_date(metadata.effective_date.as_ref()))
        .bind(coerce_date(metadata.last_updated.as_ref()))
        .bind(joined_text(metadata.applies_to.as_ref()))
        .bind(&metadata.raw)
        .bind(&self.created_by)
        .fetch_one(&mut *conn)
        .await?;

        info!(citation = %metadata.cfr_citation, regulation_id = id, "Created regulation for citation");
        Ok(id)
    }
}

#[async_trait]
impl RecordMapper for CfrContentMapper {
    type Record = CfrItem;

    fn table(&self) -> &'static str {
        "cfr_content"
    }

    async fn insert_version(&self, conn: &mut PgConnection, doc: &Document<CfrItem>) -> Result<i64> {
        let regulation_id = self.regulation_id(conn, &doc.record.metadata).await?;
        let item = &doc.record.item;
        let location = item.location();
        let source_location = item
            .source_location
            .as_ref()
            .map_or_else(|| serde_json::json!({}), |s| s.raw.clone());

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO cfr_content (
                logical_key, content_hash, is_current, regulation_id, content_type, content_code,
                title, section_number, subsection, paragraph, page_number, line_reference,
                hierarchy_path, content_text, summary, category, status, source_location,
                cross_references, related_terms, source_data, created_by, updated_by
            ) VALUES (
                $1, $2, TRUE, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $21
            )
            RETURNING id
            "#,
        )
        .bind(&doc.logical_key)
        .bind(&doc.content_hash)
        .bind(regulation_id)
        .bind(item.content_type.as_str())
        .bind(location.content_code())
        .bind(&item.content.title)
        .bind(&location.section)
        .bind(&location.subsection)
        .bind(&location.paragraph)
        .bind(coerce_i32(location.page_number.as_ref()))
        .bind(&location.line_reference)
        .bind(coerce_array(item.hierarchy_path.as_ref()))
        .bind(&item.content.text)
        .bind(&item.content.summary)
        .bind(&item.content.category)
        .bind(&item.content.status)
        .bind(&source_location)
        .bind(item.cross_references.clone().unwrap_or_else(|| Value::Array(Vec::new())))
        .bind(coerce_array(item.related_terms.as_ref()))
        .bind(&item.raw)
        .bind(&self.created_by)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn update_version(&self, conn: &mut PgConnection, id: i64, doc: &Document<CfrItem>) -> Result<()> {
        let item = &doc.record.item;
        let location = item.location();
        let source_location = item
            .source_location
            .as_ref()
            .map_or_else(|| serde_json::json!({}), |s| s.raw.clone());

        let result = sqlx::query(
            r#"
            UPDATE cfr_content SET
                content_hash = $2, is_current = TRUE, content_type = $3, content_code = $4,
                title = $5, section_number = $6, subsection = $7, paragraph = $8,
                page_number = $9, line_reference = $10, hierarchy_path = $11,
                content_text = $12, summary = $13, category = $14, status = $15,
                source_location = $16, cross_references = $17, related_terms = $18,
                source_data = $19, updated_by = $20, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&doc.content_hash)
        .bind(item.content_type.as_str())
        .bind(location.content_code())
        .bind(&item.content.title)
        .bind(&location.section)
        .bind(&location.subsection)
        .bind(&location.paragraph)
        .bind(coerce_i32(location.page_number.as_ref()))
        .bind(&location.line_reference)
        .bind(coerce_array(item.hierarchy_path.as_ref()))
        .bind(&item.content.text)
        .bind(&item.content.summary)
        .bind(&item.content.category)
        .bind(&item.content.status)
        .bind(&source_location)
        .bind(item.cross_references.clone().unwrap_or_else(|| Value::Array(Vec::new())))
        .bind(coerce_array(item.related_terms.as_ref()))
        .bind(&item.raw)
        .bind(&self.created_by)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::record(&doc.logical_key, format!("content row {id} no longer exists")));
        }
        Ok(())
    }

    async fn write_children(&self, conn: &mut PgConnection, id: i64, doc: &Document<CfrItem>) -> Result<u64> {
        let item = &doc.record.item;
        let result = match item.content_type {
            ContentType::Training => {
                let Some(details) = &item.training_details else {
                    return Ok(0);
                };
                sqlx::query(
                    r#"
                    INSERT INTO cfr_training_details (
                        content_id, frequency, scope, trainer_requirements, audience,
                        quality_benchmark, example_institutions, industry_specific,
                        trigger_condition, performance_standard, procedure_steps, required_elements
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    "#,
                )
                .bind(id)
                .bind(&details.frequency)
                .bind(&details.scope)
                .bind(&details.trainer_requirements)
                .bind(&details.audience)
                .bind(&details.quality_benchmark)
                .bind(coerce_array(details.example_institutions.as_ref()))
                .bind(joined_text(details.industry_specific.as_ref()))
                .bind(&details.trigger)
                .bind(&details.performance_standard)
                .bind(coerce_array(item.procedure_steps.as_ref()))
                .bind(coerce_array(item.required_elements.as_ref()))
                .execute(&mut *conn)
                .await?
            },
            ContentType::Reference => {
                let Some(details) = &item.reference_details else {
                    return Ok(0);
                };
                sqlx::query(
                    r#"
                    INSERT INTO cfr_reference_details (
                        content_id, standard_id, reference_title, organization,
                        publication_year, purpose, incorporation_method, publication_title
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(id)
                .bind(&details.standard_id)
                .bind(&details.title)
                .bind(&details.organization)
                .bind(coerce_i32(details.publication_year.as_ref()))
                .bind(&details.purpose)
                .bind(&details.incorporation_method)
                .bind(&details.publication_title)
                .execute(&mut *conn)
                .await?
            },
            ContentType::Appendix => {
                let Some(details) = &item.appendix_details else {
                    return Ok(0);
                };
                sqlx::query(
                    r#"
                    INSERT INTO cfr_appendix_details (
                        content_id, appendix_type, purpose, scope, content_areas,
                        organizations, coverage, test_methods, includes
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(id)
                .bind(&details.appendix_type)
                .bind(&details.purpose)
                .bind(&details.scope)
                .bind(coerce_array(details.content_areas.as_ref()))
                .bind(coerce_array(details.organizations.as_ref()))
                .bind(joined_text(details.coverage.as_ref()))
                .bind(coerce_array(details.test_methods.as_ref()))
                .bind(coerce_array(details.includes.as_ref()))
                .execute(&mut *conn)
                .await?
            },
            ContentType::Definition | ContentType::Procedure => return Ok(0),
        };
        Ok(result.rows_affected())
    }

    async fn delete_children(&self, conn: &mut PgConnection, id: i64) -> Result<u64> {
        let mut removed = 0;
        for table in ["cfr_training_details", "cfr_reference_details", "cfr_appendix_details"] {
            let sql = format!("DELETE FROM {table} WHERE content_id = $1");
            removed += sqlx::query(&sql).bind(id).execute(&mut *conn).await?.rows_affected();
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "document_metadata": {
                "cfr_citation": "29 CFR 1910 Subpart Z",
                "title": "Toxic and Hazardous Substances",
                "effective_date": "2012-05-25"
            },
            "extracted_content": [
                {
                    "content_type": "definition",
                    "source_location": { "section": "1910.1200", "subsection": "(c)", "page_number": "12" },
                    "content": { "title": "Chemical", "text": "Any substance, or mixture of substances." },
                    "related_terms": ["mixture", "substance"]
                },
                {
                    "content_type": "training",
                    "source_location": { "section": "1910.1200", "subsection": "(h)" },
                    "content": { "title": "Employee information and training" },
                    "training_details": { "frequency": "at initial assignment", "example_institutions": "community colleges" },
                    "procedure_steps": ["identify hazards", "explain labels"]
                },
                {
                    "content_type": "definition",
                    "source_location": { "section": "1910.1200", "subsection": "(c)" },
                    "content": { "title": "Article" }
                },
                {
                    "content_type": "regulatory_note",
                    "source_location": { "section": "1910.1200", "subsection": "(j)" }
                },
                {
                    "content_type": "procedure",
                    "content": { "title": "Unlocated procedure" }
                }
            ]
        })
    }

    #[test]
    fn test_parse_citation() {
        assert_eq!(
            parse_citation("29 CFR 1910 Subpart Z"),
            (29, "1910".to_string(), "Subpart Z".to_string())
        );
        assert_eq!(
            parse_citation("30 CFR 56 Subpart N"),
            (30, "56".to_string(), "Subpart N".to_string())
        );
        assert_eq!(parse_citation("29 CFR 1904"), (29, String::new(), String::new()));
    }

    #[test]
    fn test_parse_splits_items_with_stable_keys() {
        let raw = sample();
        let items = raw["extracted_content"].as_array().unwrap().clone();
        let docs = parse(raw, "hazcom.json").unwrap();
        let keys: Vec<&str> = docs.iter().map(Parsed::key).collect();
        assert_eq!(
            keys,
            vec![
                format!("29 CFR 1910 Subpart Z:1910.1200(c)#{}", item_fingerprint(&items[0])),
                "29 CFR 1910 Subpart Z:1910.1200(h)".to_string(),
                format!("29 CFR 1910 Subpart Z:1910.1200(c)#{}", item_fingerprint(&items[2])),
                "29 CFR 1910 Subpart Z:1910.1200(j)".to_string(),
                format!("29 CFR 1910 Subpart Z:item-{}", item_fingerprint(&items[4])),
            ]
        );
        assert_ne!(item_fingerprint(&items[0]), item_fingerprint(&items[2]));
        assert_eq!(item_fingerprint(&items[0]).len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_keys_survive_reordering() {
        let keyed = |raw: Value| {
            let mut pairs: Vec<(String, String)> = parse(raw, "hazcom.json")
                .unwrap()
                .into_iter()
                .filter_map(|d| match d {
                    Parsed::Ready(doc) => Some((doc.logical_key, doc.content_hash)),
                    Parsed::Rejected { .. } => None,
                })
                .collect();
            pairs.sort();
            pairs
        };

        let mut reordered = sample();
        let items = reordered["extracted_content"].as_array_mut().unwrap();
        items.reverse();
        items.insert(0, json!({ "content_type": "appendix", "content": { "title": "Appendix A" } }));

        let before = keyed(sample());
        let after = keyed(reordered);
        assert_eq!(after.len(), before.len() + 1);
        assert!(before.iter().all(|pair| after.contains(pair)));
    }

    #[test]
    fn test_unknown_content_type_is_rejected_per_item() {
        let docs = parse(sample(), "hazcom.json").unwrap();
        assert!(matches!(docs[3], Parsed::Rejected { .. }));
        assert_eq!(docs.iter().filter(|d| matches!(d, Parsed::Ready(_))).count(), 4);
    }

    #[test]
    fn test_item_fields_map() {
        let docs = parse(sample(), "hazcom.json").unwrap();
        let Parsed::Ready(definition) = &docs[0] else {
            panic!("expected a ready document");
        };
        let item = &definition.record.item;
        assert_eq!(item.content_type, ContentType::Definition);
        assert_eq!(item.location().content_code().as_deref(), Some("1910.1200(c)"));
        assert_eq!(coerce_i32(item.location().page_number.as_ref()), Some(12));
        assert_eq!(coerce_array(item.related_terms.as_ref()), vec!["mixture", "substance"]);
        assert_eq!(definition.record.metadata.cfr_citation, "29 CFR 1910 Subpart Z");

        let Parsed::Ready(training) = &docs[1] else {
            panic!("expected a ready document");
        };
        let details = training.record.item.training_details.as_ref().unwrap();
        assert_eq!(details.frequency.as_deref(), Some("at initial assignment"));
        assert_eq!(coerce_array(details.example_institutions.as_ref()), vec!["community colleges"]);
    }

    #[test]
    fn test_item_hash_ignores_other_items() {
        let first = parse(sample(), "hazcom.json").unwrap();
        let mut changed = sample();
        changed["extracted_content"][1]["content"]["title"] = json!("Training, revised");
        let second = parse(changed, "hazcom.json").unwrap();

        let hash = |docs: &[Parsed<CfrItem>], i: usize| match &docs[i] {
            Parsed::Ready(doc) => doc.content_hash.clone(),
            Parsed::Rejected { .. } => panic!("expected a ready document"),
        };
        assert_eq!(hash(&first, 0), hash(&second, 0));
        assert_ne!(hash(&first, 1), hash(&second, 1));
    }

    #[test]
    fn test_missing_sections_are_structural() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("extracted_content");
        assert!(parse(raw, "hazcom.json").unwrap_err().is_fatal());

        let raw = json!({ "document_metadata": {}, "extracted_content": [] });
        assert!(parse(raw, "hazcom.json").unwrap_err().is_fatal());
    }
}
