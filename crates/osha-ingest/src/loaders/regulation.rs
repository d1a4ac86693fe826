//! Regulation loader
//!
//! One JSON file describes one CFR subpart: the regulation header, sections
//! of rules with their trigger and exception conditions, and appendices. The
//! regulation row is versioned; rules, conditions, definitions and appendices
//! are child rows rewritten with it.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgConnection;
use std::path::Path;

use super::{joined_text, opt_text, require_fields, run_json, text, LoadContext, LoaderRun, Parsed, Sourced};
use crate::coerce::{coerce_array, coerce_date, coerce_string, infer_data_type};
use crate::error::{IngestError, Result};
use crate::framework::{compute_content_hash, Document, RecordMapper};

pub const LOAD_TYPE: &str = "regulation";

/// CFR title for every OSHA regulation
const TITLE_NUMBER: i32 = 29;

const DEFINITIONS_SECTION: &str = "Definitions";

#[derive(Debug, Clone, Deserialize)]
pub struct RegulationFile {
    pub regulation: Sourced<RegulationHeader>,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub appendices: Vec<Appendix>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegulationHeader {
    #[serde(deserialize_with = "text")]
    pub part: String,
    #[serde(deserialize_with = "text")]
    pub subpart: String,
    #[serde(deserialize_with = "text")]
    pub title: String,
    #[serde(default)]
    pub authority: Option<Value>,
    #[serde(default)]
    pub effective_date: Option<Value>,
    #[serde(default)]
    pub last_updated: Option<Value>,
    #[serde(default)]
    pub applies_to: Option<Value>,
    #[serde(default)]
    pub excludes: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Section {
    #[serde(default, deserialize_with = "opt_text")]
    pub section_number: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub title: Option<String>,
    #[serde(default)]
    pub subsections: Vec<Subsection>,
}

impl Section {
    fn is_definitions(&self) -> bool {
        self.title
            .as_deref()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case(DEFINITIONS_SECTION))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subsection {
    #[serde(default, deserialize_with = "opt_text")]
    pub subsection: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub title: Option<String>,
    #[serde(default)]
    pub rules: Vec<Sourced<RuleSpec>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    #[serde(deserialize_with = "text")]
    pub rule_id: String,
    #[serde(default, deserialize_with = "opt_text")]
    pub text: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "opt_text")]
    pub rule_type: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub requirement: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub severity: Option<String>,
    #[serde(default)]
    pub applies_to: Option<Value>,
    #[serde(default)]
    pub work_types: Option<Value>,
    #[serde(default)]
    pub protections: Option<Value>,
    #[serde(default)]
    pub personnel_required: Option<Value>,
    #[serde(default)]
    pub triggers: Option<Triggers>,
    #[serde(default)]
    pub exceptions: Option<Exceptions>,
}

impl RuleSpec {
    /// Defined term for rules of a definitions section
    ///
    /// `1926.500(b)-hole` defines `hole`; without a suffix the requirement
    /// text names the term.
    pub fn defined_term(&self) -> String {
        match self.rule_id.rsplit_once('-') {
            Some((_, term)) if !term.trim().is_empty() => term.trim().to_string(),
            _ => self
                .requirement
                .clone()
                .unwrap_or_else(|| "unknown_term".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Triggers {
    #[serde(default, deserialize_with = "opt_text")]
    pub expression: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Sourced<ConditionSpec>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Exceptions {
    #[serde(default, deserialize_with = "opt_text")]
    pub expression: Option<String>,
    #[serde(default)]
    pub items: Vec<ExceptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExceptionItem {
    #[serde(default, deserialize_with = "opt_text")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub description: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Sourced<ConditionSpec>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSpec {
    #[serde(default, deserialize_with = "opt_text")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub condition: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, deserialize_with = "opt_text")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Appendix {
    #[serde(default, deserialize_with = "opt_text")]
    pub appendix_id: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub purpose: Option<String>,
    #[serde(default)]
    pub key_rule: Option<Sourced<RuleSpec>>,
}

/// Where a rule sits in the document
struct RulePlacement<'a> {
    section_number: Option<&'a str>,
    section_title: Option<&'a str>,
    subsection: Option<&'a str>,
    subsection_title: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Trigger,
    Exception,
    DescriptionOnly,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Trigger => "trigger",
            ConditionKind::Exception => "exception",
            ConditionKind::DescriptionOnly => "description_only",
        }
    }
}

/// Column values for one `conditions` row
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionRow {
    pub condition_key: String,
    pub kind: ConditionKind,
    pub parameter: Option<String>,
    pub operator: Option<String>,
    pub value: Option<String>,
    pub unit: Option<String>,
    pub description: String,
    pub data_type: Option<&'static str>,
    pub details: Value,
}

impl ConditionRow {
    fn from_spec(spec: &Sourced<ConditionSpec>, kind: ConditionKind) -> Self {
        Self {
            condition_key: spec.id.clone().unwrap_or_else(|| "unknown".to_string()),
            kind,
            parameter: spec.condition.clone(),
            operator: spec.operator.clone(),
            value: Some(joined_text(spec.value.as_ref()).unwrap_or_default()),
            unit: spec.unit.clone(),
            description: spec.condition.clone().unwrap_or_default(),
            data_type: Some(infer_data_type(spec.value.as_ref())),
            details: spec.raw.clone(),
        }
    }

    fn description_only(item: &ExceptionItem) -> Self {
        Self {
            condition_key: item.id.clone().unwrap_or_else(|| "unknown".to_string()),
            kind: ConditionKind::DescriptionOnly,
            parameter: None,
            operator: None,
            value: None,
            unit: None,
            description: item.description.clone().unwrap_or_default(),
            data_type: None,
            details: json!({ "id": item.id, "description": item.description }),
        }
    }
}

/// Every condition row of a rule, in document order
pub fn condition_rows(rule: &RuleSpec) -> Vec<ConditionRow> {
    let mut rows = Vec::new();
    if let Some(triggers) = &rule.triggers {
        rows.extend(
            triggers
                .conditions
                .iter()
                .map(|c| ConditionRow::from_spec(c, ConditionKind::Trigger)),
        );
    }
    if let Some(exceptions) = &rule.exceptions {
        for item in &exceptions.items {
            rows.extend(
                item.conditions
                    .iter()
                    .map(|c| ConditionRow::from_spec(c, ConditionKind::Exception)),
            );
            rows.push(ConditionRow::description_only(item));
        }
    }
    rows
}

pub fn logical_key(part: &str, subpart: &str) -> String {
    format!("{TITLE_NUMBER}-CFR-{part}-Subpart-{subpart}")
}

/// Validate one regulation file and turn it into a document
///
/// Missing `regulation`, `sections` or header fields are structural; a file
/// that has them but does not fit the typed model is rejected on its own.
pub fn parse(raw: Value, origin: &str) -> Result<Vec<Parsed<RegulationFile>>> {
    require_fields(&raw, &["regulation", "sections"], origin, "document")?;
    require_fields(&raw["regulation"], &["part", "subpart", "title"], origin, "regulation")?;

    let part = coerce_string(raw["regulation"].get("part"))
        .ok_or_else(|| IngestError::structural(origin, "regulation.part is not a scalar"))?;
    let subpart = coerce_string(raw["regulation"].get("subpart"))
        .ok_or_else(|| IngestError::structural(origin, "regulation.subpart is not a scalar"))?;

    Ok(vec![Parsed::from_raw(logical_key(&part, &subpart), &raw)])
}

pub async fn run(ctx: &mut LoadContext, path: &Path) -> Result<LoaderRun> {
    let mapper = RegulationMapper::new(&ctx.created_by);
    run_json(ctx, path, LOAD_TYPE, mapper, parse).await
}

pub struct RegulationMapper {
    created_by: String,
}

impl RegulationMapper {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
        }
    }

    async fn insert_rule(
        &self,
        conn: &mut PgConnection,
        regulation_id: i64,
        rule: &Sourced<RuleSpec>,
        placement: &RulePlacement<'_>,
    ) -> Result<u64> {
        let triggers = rule.triggers.clone().unwrap_or_default();
        let exceptions = rule.exceptions.clone().unwrap_or_default();

        let (rule_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO rules (
                regulation_id, rule_code, rule_text, rule_type, compliance_requirement,
                severity, section_number, section_title, subsection, subsection_title,
                applies_to, work_types, protections, personnel_required,
                trigger_expression, exception_expression, rule_hash, source_data, created_by
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING id
            "#,
        )
        .bind(regulation_id)
        .bind(&rule.rule_id)
        .bind(&rule.text)
        .bind(&rule.rule_type)
        .bind(&rule.requirement)
        .bind(&rule.severity)
        .bind(placement.section_number)
        .bind(placement.section_title)
        .bind(placement.subsection)
        .bind(placement.subsection_title)
        .bind(coerce_array(rule.applies_to.as_ref()))
        .bind(coerce_array(rule.work_types.as_ref()))
        .bind(coerce_array(rule.protections.as_ref()))
        .bind(coerce_array(rule.personnel_required.as_ref()))
        .bind(triggers.expression.filter(|e| !e.is_empty()))
        .bind(exceptions.expression.filter(|e| !e.is_empty()))
        .bind(compute_content_hash(&rule.raw))
        .bind(&rule.raw)
        .bind(&self.created_by)
        .fetch_one(&mut *conn)
        .await?;

        let mut written = 1;
        for condition in condition_rows(rule) {
            sqlx::query(
                r#"
                INSERT INTO conditions (
                    rule_id, condition_key, condition_type, parameter, operator,
                    value, unit, description, data_type, condition_details
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(rule_id)
            .bind(&condition.condition_key)
            .bind(condition.kind.as_str())
            .bind(&condition.parameter)
            .bind(&condition.operator)
            .bind(&condition.value)
            .bind(&condition.unit)
            .bind(&condition.description)
            .bind(condition.data_type)
            .bind(&condition.details)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait]
impl RecordMapper for RegulationMapper {
    type Record = RegulationFile;

    fn table(&self) -> &'static str {
        "regulations"
    }

    async fn insert_version(
        &self,
        conn: &mut PgConnection,
        doc: &Document<RegulationFile>,
    ) -> Result<i64> {
        let header = &doc.record.regulation;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO regulations (
                logical_key, content_hash, is_current, title_number, title, part, subpart,
                section_title, authority, effective_date, last_updated, applies_to, excludes,
                source_data, created_by, updated_by
            ) VALUES ($1, $2, TRUE, $3, $4, $5, $6, $4, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING id
            "#,
        )
        .bind(&doc.logical_key)
        .bind(&doc.content_hash)
        .bind(TITLE_NUMBER)
        .bind(&header.title)
        .bind(&header.part)
        .bind(&header.subpart)
        .bind(joined_text(header.authority.as_ref()))
        .bind(coerce_date(header.effective_date.as_ref()))
        .bind(coerce_date(header.last_updated.as_ref()))
        .bind(joined_text(header.applies_to.as_ref()))
        .bind(coerce_array(header.excludes.as_ref()))
        .bind(&header.raw)
        .bind(&self.created_by)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn update_version(
        &self,
        conn: &mut PgConnection,
        id: i64,
        doc: &Document<RegulationFile>,
    ) -> Result<()> {
        let header = &doc.record.regulation;
        let result = sqlx::query(
            r#"
            UPDATE regulations SET
                content_hash = $2, is_current = TRUE, title = $3, section_title = $3,
                part = $4, subpart = $5, authority = $6, effective_date = $7,
                last_updated = $8, applies_to = $9, excludes = $10, source_data = $11,
                updated_by = $12, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&doc.content_hash)
        .bind(&header.title)
        .bind(&header.part)
        .bind(&header.subpart)
        .bind(joined_text(header.authority.as_ref()))
        .bind(coerce_date(header.effective_date.as_ref()))
        .bind(coerce_date(header.last_updated.as_ref()))
        .bind(joined_text(header.applies_to.as_ref()))
        .bind(coerce_array(header.excludes.as_ref()))
        .bind(&header.raw)
        .bind(&self.created_by)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::record(&doc.logical_key, format!("regulation row {id} no longer exists")));
        }
        Ok(())
    }

    async fn write_children(
        &self,
        conn: &mut PgConnection,
        id: i64,
        doc: &Document<RegulationFile>,
    ) -> Result<u64> {
        let file = &doc.record;
        let mut written = 0;

        for section in &file.sections {
            for subsection in &section.subsections {
                let placement = RulePlacement {
                    section_number: section.section_number.as_deref(),
                    section_title: section.title.as_deref(),
                    subsection: subsection.subsection.as_deref(),
                    subsection_title: subsection.title.as_deref(),
                };
                for rule in &subsection.rules {
                    written += self.insert_rule(conn, id, rule, &placement).await?;

                    if section.is_definitions() {
                        sqlx::query(
                            "INSERT INTO definitions (regulation_id, term, definition_text, context_section) \
                             VALUES ($1, $2, $3, $4)",
                        )
                        .bind(id)
                        .bind(rule.defined_term())
                        .bind(rule.text.clone().unwrap_or_default())
                        .bind(section.section_number.clone().unwrap_or_default())
                        .execute(&mut *conn)
                        .await?;
                        written += 1;
                    }
                }
            }
        }

        for appendix in &file.appendices {
            let title = appendix.title.as_deref().unwrap_or("Appendix");
            sqlx::query(
                "INSERT INTO appendices (regulation_id, appendix_code, title, content_text, appendix_type) \
                 VALUES ($1, $2, $3, $4, 'guidance')",
            )
            .bind(id)
            .bind(&appendix.appendix_id)
            .bind(&appendix.title)
            .bind(&appendix.purpose)
            .execute(&mut *conn)
            .await?;
            written += 1;

            if let Some(key_rule) = &appendix.key_rule {
                let placement = RulePlacement {
                    section_number: Some("Appendix"),
                    section_title: Some(title),
                    subsection: Some(appendix.appendix_id.as_deref().unwrap_or("A")),
                    subsection_title: Some(title),
                };
                written += self.insert_rule(conn, id, key_rule, &placement).await?;
            }
        }

        Ok(written)
    }

    async fn delete_children(&self, conn: &mut PgConnection, id: i64) -> Result<u64> {
        let mut removed = 0;
        for sql in [
            "DELETE FROM conditions WHERE rule_id IN (SELECT id FROM rules WHERE regulation_id = $1)",
            "DELETE FROM rules WHERE regulation_id = $1",
            "DELETE FROM definitions WHERE regulation_id = $1",
            "DELETE FROM appendices WHERE regulation_id = $1",
        ] {
            removed += sqlx::query(sql).bind(id).execute(&mut *conn).await?.rows_affected();
        }
        Ok(removed)
    }
}
