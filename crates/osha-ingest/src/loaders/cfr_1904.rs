//! Relational 29 CFR 1904 loader
//!
//! Reads the same recordkeeping document as [`super::recordkeeping`], but
//! spreads it over a `regulation_versions` row and one table per rule
//! section: legal authorities, amendments, size and industry exemptions, the
//! recordability decision tree, recording criteria, forms, privacy cases,
//! government reporting, definitions and first aid treatments.
//!
//! Versions are keyed like the JSONB document (`{regulation_id}:{version}`)
//! and only the latest written version of a regulation is current.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::path::Path;
use std::sync::LazyLock;

use super::recordkeeping::{document_key, DEFAULT_PARSING_VERSION, REQUIRED_SECTIONS};
use super::{demote_other_current, require_fields, run_json, LoadContext, LoaderRun, Parsed};
use crate::coerce::{coerce_date, coerce_i32, coerce_string, coerce_timestamp};
use crate::error::{IngestError, Result};
use crate::framework::{Document, RecordMapper};

pub const LOAD_TYPE: &str = "cfr_1904";

/// Used when an exemption's condition names no employee count
pub const DEFAULT_EMPLOYEE_THRESHOLD: i32 = 10;

const PRIVACY_CASE_PROCEDURE: &str = "may_not_enter_employee_name_use_privacy_case_procedures";

/// Child tables keyed directly by `version_id`
const VERSION_TABLES: [&str; 14] = [
    "regulation_authorities",
    "regulation_amendments",
    "size_exemptions",
    "naics_codes",
    "decision_tree_steps",
    "work_relatedness_criteria",
    "general_recording_criteria",
    "specific_recording_criteria",
    "required_forms",
    "privacy_concern_cases",
    "immediate_reporting_requirements",
    "required_reporting_information",
    "regulatory_definitions",
    "first_aid_treatments",
];

#[allow(clippy::expect_used)]
static FIRST_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("number pattern compiles"));

fn field(value: &Value, key: &str) -> Option<String> {
    coerce_string(value.get(key))
}

fn items<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn strings(value: &Value, pointer: &str) -> Vec<String> {
    items(value, pointer)
        .iter()
        .filter_map(|v| coerce_string(Some(v)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityType {
    Usc,
    Cfr,
    Other,
}

impl AuthorityType {
    pub fn of(citation: &str) -> Self {
        if citation.contains("U.S.C.") {
            AuthorityType::Usc
        } else if citation.contains("CFR") {
            AuthorityType::Cfr
        } else {
            AuthorityType::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityType::Usc => "USC",
            AuthorityType::Cfr => "CFR",
            AuthorityType::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Amendment {
    pub date: Option<NaiveDate>,
    pub citation: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeExemptionException {
    pub exception_type: Option<String>,
    pub requirement: Option<String>,
    pub regulation_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeExemption {
    pub exemption_id: Option<String>,
    pub regulation_ref: Option<String>,
    pub employee_threshold: i32,
    pub condition: Option<String>,
    pub scope: Option<String>,
    pub result: Option<String>,
    pub verbatim_text: Option<String>,
    pub exceptions: Vec<SizeExemptionException>,
}

/// First number in the condition text (`10 or fewer employees`)
pub fn employee_threshold(condition: Option<&str>) -> i32 {
    condition
        .and_then(|c| FIRST_NUMBER.find(c))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(DEFAULT_EMPLOYEE_THRESHOLD)
}

impl SizeExemption {
    fn from_value(value: &Value) -> Self {
        let condition = field(value, "condition");
        Self {
            exemption_id: field(value, "exemption_id"),
            regulation_ref: field(value, "regulation_ref"),
            employee_threshold: employee_threshold(condition.as_deref()),
            condition,
            scope: field(value, "scope"),
            result: field(value, "result"),
            verbatim_text: field(value, "verbatim_text"),
            exceptions: items(value, "/exceptions")
                .iter()
                .map(|e| SizeExemptionException {
                    exception_type: field(e, "exception_type"),
                    requirement: field(e, "requirement"),
                    regulation_ref: field(e, "regulation_ref"),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NaicsCode {
    pub code: String,
    pub industry: Option<String>,
    pub exemption_type: String,
    pub appendix: &'static str,
}

/// Codes listed under industry exemptions, then the appendix reference lists
///
/// An exemption entry may be a bare code or `{"code", "industry"}`. Appendix
/// lists are keyed like `appendix_a_partially_exempt`; the key minus its
/// `appendix_` prefix becomes the exemption type.
pub fn naics_codes(applicability: &Value) -> Vec<NaicsCode> {
    let mut codes = Vec::new();

    for exemption in items(applicability, "/industry_exemptions") {
        for item in items(exemption, "/naics_codes") {
            let (code, industry) = match item {
                Value::Object(_) => (field(item, "code"), field(item, "industry")),
                other => (coerce_string(Some(other)), None),
            };
            if let Some(code) = code {
                codes.push(NaicsCode {
                    code,
                    industry,
                    exemption_type: "partial_exemption".to_string(),
                    appendix: "A",
                });
            }
        }
    }

    if let Some(appendices) = applicability.pointer("/reference_data/naics_codes").and_then(Value::as_object) {
        for (key, list) in appendices {
            let appendix = if key.contains("appendix_a") {
                "A"
            } else if key.contains("appendix_b") {
                "B"
            } else {
                "Other"
            };
            let exemption_type = key.strip_prefix("appendix_").unwrap_or(key);
            for item in list.as_array().map(Vec::as_slice).unwrap_or(&[]) {
                let code = match item {
                    Value::Object(_) => field(item, "naics_code"),
                    other => coerce_string(Some(other)),
                };
                if let Some(code) = code {
                    codes.push(NaicsCode {
                        code,
                        industry: field(item, "industry"),
                        exemption_type: exemption_type.to_string(),
                        appendix,
                    });
                }
            }
        }
    }

    codes
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionStep {
    pub step_number: Option<i32>,
    pub question: Option<String>,
    pub regulation_ref: Option<String>,
    pub yes_path: Option<String>,
    pub no_path: Option<String>,
    pub determination_method: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkRelatednessException {
    pub exception_type: Option<String>,
    pub description: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkRelatedness {
    pub regulation_ref: Option<String>,
    pub basic_requirement: Option<String>,
    pub presumption: Option<String>,
    pub work_environment_definition: Option<String>,
    pub exceptions: Vec<WorkRelatednessException>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdditionalRequirement {
    pub requirement: Option<String>,
    pub timing: Option<String>,
    pub regulation_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralCriterion {
    pub name: Option<String>,
    pub regulation_ref: Option<String>,
    pub condition: Option<String>,
    pub form_name: Option<String>,
    pub form_action: Option<String>,
    pub additional_requirements: Vec<AdditionalRequirement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecificCriterion {
    pub criterion_type: String,
    pub regulation_ref: Option<String>,
    pub requirement: Option<String>,
    pub form_entry: Option<String>,
    pub privacy_protection_required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequiredForm {
    pub form_id: Option<String>,
    pub form_name: Option<String>,
    pub regulation_ref: Option<String>,
    pub purpose: Option<String>,
    pub deadline: Option<String>,
    pub trigger: Option<String>,
    pub required_information: Vec<String>,
}

impl RequiredForm {
    /// A form is either its bare id (`"300A"`) or a full description
    fn from_value(value: &Value) -> Self {
        if !value.is_object() {
            return Self {
                form_id: coerce_string(Some(value)),
                form_name: None,
                regulation_ref: None,
                purpose: None,
                deadline: None,
                trigger: None,
                required_information: Vec::new(),
            };
        }
        Self {
            form_id: field(value, "form_id"),
            form_name: field(value, "form_name"),
            regulation_ref: field(value, "regulation_ref"),
            purpose: field(value, "purpose"),
            deadline: value.pointer("/completion_timing/deadline").and_then(|v| coerce_string(Some(v))),
            trigger: value.pointer("/completion_timing/trigger").and_then(|v| coerce_string(Some(v))),
            required_information: strings(value, "/required_information"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrivacyCase {
    pub case_type: String,
    pub description: String,
    pub handling: Option<String>,
}

/// `sexual_assault` -> `Sexual Assault`
pub fn title_case(raw: &str) -> String {
    raw.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImmediateReport {
    pub trigger: Option<String>,
    pub regulation_ref: Option<String>,
    pub deadline: Option<String>,
    pub recipient: Option<String>,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub term: String,
    pub regulation_ref: Option<String>,
    pub definition_type: Option<String>,
    pub text: String,
}

impl Definition {
    /// Structured definitions fall back from the basic definition to the
    /// completeness note, then to the whole entry as JSON
    fn from_entry(term: &str, value: &Value) -> Self {
        if value.is_object() {
            let text = field(value, "basic_definition")
                .or_else(|| field(value, "completeness_note"))
                .unwrap_or_else(|| value.to_string());
            Self {
                term: term.to_string(),
                regulation_ref: field(value, "regulation_ref"),
                definition_type: field(value, "definition_type"),
                text,
            }
        } else {
            Self {
                term: term.to_string(),
                regulation_ref: None,
                definition_type: Some("basic_definition".to_string()),
                text: coerce_string(Some(value)).unwrap_or_else(|| value.to_string()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirstAidTreatment {
    pub name: Option<String>,
    pub details: Option<String>,
    pub exception: Option<String>,
}

/// One parsed version of the rules, ready for the relational tables
#[derive(Debug, Clone)]
pub struct RecordkeepingVersion {
    pub regulation_id: String,
    pub version_number: String,
    pub effective_date: NaiveDate,
    pub last_updated: Option<NaiveDateTime>,
    pub source_url: Option<String>,
    pub authorities: Vec<String>,
    pub amendments: Vec<Amendment>,
    pub size_exemptions: Vec<SizeExemption>,
    pub naics_codes: Vec<NaicsCode>,
    pub decision_steps: Vec<DecisionStep>,
    pub work_relatedness: Option<WorkRelatedness>,
    pub general_criteria: Vec<GeneralCriterion>,
    pub specific_criteria: Vec<SpecificCriterion>,
    pub forms: Vec<RequiredForm>,
    pub privacy_cases: Vec<PrivacyCase>,
    pub immediate_reports: Vec<ImmediateReport>,
    pub reporting_information: Vec<String>,
    pub definitions: Vec<Definition>,
    pub first_aid: Vec<FirstAidTreatment>,
}

impl RecordkeepingVersion {
    fn from_raw(raw: &Value, key: &str, regulation_id: String, version_number: String) -> Result<Self> {
        let metadata = &raw["regulation_metadata"];
        let effective_date = coerce_date(metadata.get("effective_date")).ok_or_else(|| {
            IngestError::record(key, format!("unreadable effective_date {}", metadata["effective_date"]))
        })?;

        let applicability = &raw["company_applicability"];
        let criteria = &raw["recording_criteria"];
        let forms = &raw["form_requirements"];
        let reporting = &raw["government_reporting"];
        let definitions = raw.pointer("/reference_data/definitions");

        let work_relatedness = criteria
            .get("work_relatedness_criteria")
            .filter(|w| w.is_object())
            .map(|w| WorkRelatedness {
                regulation_ref: field(w, "regulation_ref"),
                basic_requirement: field(w, "basic_requirement"),
                presumption: field(w, "presumption"),
                work_environment_definition: field(w, "work_environment_definition"),
                exceptions: items(w, "/exceptions")
                    .iter()
                    .map(|e| WorkRelatednessException {
                        exception_type: field(e, "exception"),
                        description: field(e, "description"),
                        notes: field(e, "note").unwrap_or_default(),
                    })
                    .collect(),
            });

        let handling = forms
            .pointer("/privacy_protections/privacy_case_procedures/log_entry")
            .and_then(|v| coerce_string(Some(v)));

        Ok(Self {
            regulation_id,
            version_number,
            effective_date,
            last_updated: coerce_timestamp(metadata.get("last_updated")),
            source_url: field(metadata, "source_url"),
            authorities: strings(metadata, "/legal_basis"),
            amendments: items(metadata, "/editorial_notes")
                .iter()
                .map(|note| Amendment {
                    date: coerce_date(note.get("date")),
                    citation: field(note, "citation"),
                    description: field(note, "note").unwrap_or_default(),
                })
                .collect(),
            size_exemptions: items(applicability, "/size_exemptions")
                .iter()
                .map(SizeExemption::from_value)
                .collect(),
            naics_codes: naics_codes(applicability),
            decision_steps: items(criteria, "/recordability_decision_tree/decision_path")
                .iter()
                .map(|step| DecisionStep {
                    step_number: coerce_i32(step.get("step")),
                    question: field(step, "question"),
                    regulation_ref: field(step, "regulation_ref"),
                    yes_path: field(step, "yes_path"),
                    no_path: field(step, "no_path"),
                    determination_method: field(step, "determination_method"),
                    notes: field(step, "notes"),
                })
                .collect(),
            work_relatedness,
            general_criteria: items(criteria, "/general_recording_criteria")
                .iter()
                .map(|c| GeneralCriterion {
                    name: field(c, "criterion"),
                    regulation_ref: field(c, "regulation_ref"),
                    condition: field(c, "condition"),
                    form_name: c.pointer("/form_action/form").and_then(|v| coerce_string(Some(v))),
                    form_action: c.pointer("/form_action/action").and_then(|v| coerce_string(Some(v))),
                    additional_requirements: items(c, "/additional_requirements")
                        .iter()
                        .map(|r| AdditionalRequirement {
                            requirement: field(r, "requirement"),
                            timing: field(r, "timing"),
                            regulation_ref: field(r, "regulation_ref"),
                        })
                        .collect(),
                })
                .collect(),
            specific_criteria: criteria
                .get("specific_recording_criteria")
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .map(|(kind, details)| SpecificCriterion {
                            criterion_type: kind.clone(),
                            regulation_ref: field(details, "regulation_ref"),
                            requirement: field(details, "requirement"),
                            form_entry: field(details, "form_entry"),
                            privacy_protection_required: field(details, "privacy_protection").as_deref()
                                == Some(PRIVACY_CASE_PROCEDURE),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            forms: items(forms, "/required_forms")
                .iter()
                .map(RequiredForm::from_value)
                .collect(),
            privacy_cases: strings(forms, "/privacy_protections/complete_list_privacy_concern_cases")
                .into_iter()
                .map(|case_type| PrivacyCase {
                    description: title_case(&case_type),
                    case_type,
                    handling: handling.clone(),
                })
                .collect(),
            immediate_reports: items(reporting, "/immediate_reporting")
                .iter()
                .map(|r| ImmediateReport {
                    trigger: field(r, "trigger"),
                    regulation_ref: field(r, "regulation_ref"),
                    deadline: field(r, "deadline"),
                    recipient: field(r, "recipient"),
                    methods: strings(r, "/reporting_methods"),
                })
                .collect(),
            reporting_information: strings(reporting, "/required_information"),
            definitions: definitions
                .and_then(Value::as_object)
                .map(|map| map.iter().map(|(term, v)| Definition::from_entry(term, v)).collect())
                .unwrap_or_default(),
            first_aid: definitions
                .map(|d| items(d, "/first_aid/items"))
                .unwrap_or(&[])
                .iter()
                .map(|t| FirstAidTreatment {
                    name: field(t, "treatment"),
                    details: field(t, "details"),
                    exception: field(t, "exception"),
                })
                .collect(),
        })
    }

    /// Rows this version writes below `regulation_versions`
    pub fn child_rows(&self) -> usize {
        self.authorities.len()
            + self.amendments.len()
            + self.size_exemptions.iter().map(|e| 1 + e.exceptions.len()).sum::<usize>()
            + self.naics_codes.len()
            + self.decision_steps.len()
            + self.work_relatedness.as_ref().map_or(0, |w| 1 + w.exceptions.len())
            + self.general_criteria.iter().map(|c| 1 + c.additional_requirements.len()).sum::<usize>()
            + self.specific_criteria.len()
            + self.forms.iter().map(|f| 1 + f.required_information.len()).sum::<usize>()
            + self.privacy_cases.len()
            + self.immediate_reports.iter().map(|r| 1 + r.methods.len()).sum::<usize>()
            + self.reporting_information.len()
            + self.definitions.len()
            + self.first_aid.len()
    }
}

/// Validate one recordkeeping file for the relational tables
pub fn parse(raw: Value, origin: &str) -> Result<Vec<Parsed<RecordkeepingVersion>>> {
    require_fields(&raw, &REQUIRED_SECTIONS, origin, "document")?;
    require_fields(
        &raw["regulation_metadata"],
        &["regulation_id", "effective_date"],
        origin,
        "regulation_metadata",
    )?;

    let metadata = &raw["regulation_metadata"];
    let regulation_id = field(metadata, "regulation_id")
        .ok_or_else(|| IngestError::structural(origin, "regulation_id is not a scalar"))?;
    let version = field(metadata, "parsing_version").unwrap_or_else(|| DEFAULT_PARSING_VERSION.to_string());
    let key = document_key(&regulation_id, &version);

    let parsed = match RecordkeepingVersion::from_raw(&raw, &key, regulation_id, version) {
        Ok(record) => Parsed::Ready(Document::new(key, &raw, record)),
        Err(error) => Parsed::Rejected { key, error },
    };
    Ok(vec![parsed])
}

/// Child row counts of the current version, reported as notes
pub async fn integrity_check(pool: &PgPool) -> Result<Vec<String>> {
    let mut notes = Vec::with_capacity(VERSION_TABLES.len());
    for table in VERSION_TABLES {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} t JOIN regulation_versions v ON v.id = t.version_id WHERE v.is_current"
        );
        let (n,): (i64,) = sqlx::query_as(&sql).fetch_one(pool).await?;
        notes.push(format!("{table}: {n}"));
    }
    Ok(notes)
}

pub async fn run(ctx: &mut LoadContext, path: &Path) -> Result<LoaderRun> {
    let mapper = Cfr1904Mapper::new(&ctx.created_by);
    let mut run = run_json(ctx, path, LOAD_TYPE, mapper, parse).await?;
    if ctx.options.persists() {
        run.notes.extend(integrity_check(&ctx.pool).await?);
    }
    Ok(run)
}

pub struct Cfr1904Mapper {
    created_by: String,
}

impl Cfr1904Mapper {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
        }
    }

    async fn insert_applicability(&self, conn: &mut PgConnection, id: i64, version: &RecordkeepingVersion) -> Result<u64> {
        let mut written = 0;

        for exemption in &version.size_exemptions {
            let (exemption_id,): (i64,) = sqlx::query_as(
                "INSERT INTO size_exemptions (version_id, exemption_id, regulation_ref, employee_threshold, \
                     condition_description, scope, result_description, verbatim_text) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            )
            .bind(id)
            .bind(&exemption.exemption_id)
            .bind(&exemption.regulation_ref)
            .bind(exemption.employee_threshold)
            .bind(&exemption.condition)
            .bind(&exemption.scope)
            .bind(&exemption.result)
            .bind(&exemption.verbatim_text)
            .fetch_one(&mut *conn)
            .await?;
            written += 1;

            for exception in &exemption.exceptions {
                sqlx::query(
                    "INSERT INTO size_exemption_exceptions (size_exemption_id, exception_type, \
                         requirement_description, regulation_ref) VALUES ($1, $2, $3, $4)",
                )
                .bind(exemption_id)
                .bind(&exception.exception_type)
                .bind(&exception.requirement)
                .bind(&exception.regulation_ref)
                .execute(&mut *conn)
                .await?;
                written += 1;
            }
        }

        for naics in &version.naics_codes {
            sqlx::query(
                "INSERT INTO naics_codes (version_id, naics_code, industry_description, exemption_type, appendix_reference) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(&naics.code)
            .bind(&naics.industry)
            .bind(&naics.exemption_type)
            .bind(naics.appendix)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        Ok(written)
    }

    async fn insert_recording_criteria(
        &self,
        conn: &mut PgConnection,
        id: i64,
        version: &RecordkeepingVersion,
    ) -> Result<u64> {
        let mut written = 0;

        for step in &version.decision_steps {
            sqlx::query(
                "INSERT INTO decision_tree_steps (version_id, step_number, question, regulation_ref, \
                     yes_path_action, no_path_action, determination_method, notes) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(id)
            .bind(step.step_number)
            .bind(&step.question)
            .bind(&step.regulation_ref)
            .bind(&step.yes_path)
            .bind(&step.no_path)
            .bind(&step.determination_method)
            .bind(&step.notes)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        if let Some(work) = &version.work_relatedness {
            let (criteria_id,): (i64,) = sqlx::query_as(
                "INSERT INTO work_relatedness_criteria (version_id, regulation_ref, basic_requirement, \
                     presumption_rule, work_environment_definition) VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(id)
            .bind(&work.regulation_ref)
            .bind(&work.basic_requirement)
            .bind(&work.presumption)
            .bind(&work.work_environment_definition)
            .fetch_one(&mut *conn)
            .await?;
            written += 1;

            for exception in &work.exceptions {
                sqlx::query(
                    "INSERT INTO work_relatedness_exceptions (criteria_id, exception_type, description, notes) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(criteria_id)
                .bind(&exception.exception_type)
                .bind(&exception.description)
                .bind(&exception.notes)
                .execute(&mut *conn)
                .await?;
                written += 1;
            }
        }

        for criterion in &version.general_criteria {
            let (criterion_id,): (i64,) = sqlx::query_as(
                "INSERT INTO general_recording_criteria (version_id, criterion_name, regulation_ref, \
                     condition_description, form_name, form_action) VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            )
            .bind(id)
            .bind(&criterion.name)
            .bind(&criterion.regulation_ref)
            .bind(&criterion.condition)
            .bind(&criterion.form_name)
            .bind(&criterion.form_action)
            .fetch_one(&mut *conn)
            .await?;
            written += 1;

            for requirement in &criterion.additional_requirements {
                sqlx::query(
                    "INSERT INTO criterion_additional_requirements (criterion_id, requirement_type, timing, \
                         regulation_ref, description) VALUES ($1, $2, $3, $4, $2)",
                )
                .bind(criterion_id)
                .bind(&requirement.requirement)
                .bind(&requirement.timing)
                .bind(&requirement.regulation_ref)
                .execute(&mut *conn)
                .await?;
                written += 1;
            }
        }

        for criterion in &version.specific_criteria {
            sqlx::query(
                "INSERT INTO specific_recording_criteria (version_id, criterion_type, regulation_ref, \
                     requirement_description, form_entry_instructions, privacy_protection_required) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(id)
            .bind(&criterion.criterion_type)
            .bind(&criterion.regulation_ref)
            .bind(&criterion.requirement)
            .bind(&criterion.form_entry)
            .bind(criterion.privacy_protection_required)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        Ok(written)
    }

    async fn insert_forms(&self, conn: &mut PgConnection, id: i64, version: &RecordkeepingVersion) -> Result<u64> {
        let mut written = 0;

        for form in &version.forms {
            let (form_row,): (i64,) = sqlx::query_as(
                "INSERT INTO required_forms (version_id, form_id, form_name, regulation_ref, purpose_description, \
                     completion_deadline, completion_trigger) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
            )
            .bind(id)
            .bind(&form.form_id)
            .bind(&form.form_name)
            .bind(&form.regulation_ref)
            .bind(&form.purpose)
            .bind(&form.deadline)
            .bind(&form.trigger)
            .fetch_one(&mut *conn)
            .await?;
            written += 1;

            for info in &form.required_information {
                sqlx::query(
                    "INSERT INTO form_required_information (form_id, information_type, description, is_required) \
                     VALUES ($1, $2, $2, TRUE)",
                )
                .bind(form_row)
                .bind(info)
                .execute(&mut *conn)
                .await?;
                written += 1;
            }
        }

        for case in &version.privacy_cases {
            sqlx::query(
                "INSERT INTO privacy_concern_cases (version_id, case_type, description, handling_instructions) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(&case.case_type)
            .bind(&case.description)
            .bind(&case.handling)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        Ok(written)
    }

    async fn insert_reporting(&self, conn: &mut PgConnection, id: i64, version: &RecordkeepingVersion) -> Result<u64> {
        let mut written = 0;

        for report in &version.immediate_reports {
            let (report_id,): (i64,) = sqlx::query_as(
                "INSERT INTO immediate_reporting_requirements (version_id, trigger_event, regulation_ref, \
                     deadline, recipient) VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(id)
            .bind(&report.trigger)
            .bind(&report.regulation_ref)
            .bind(&report.deadline)
            .bind(&report.recipient)
            .fetch_one(&mut *conn)
            .await?;
            written += 1;

            for method in &report.methods {
                sqlx::query(
                    "INSERT INTO reporting_methods (reporting_requirement_id, method_description) VALUES ($1, $2)",
                )
                .bind(report_id)
                .bind(method)
                .execute(&mut *conn)
                .await?;
                written += 1;
            }
        }

        for info in &version.reporting_information {
            sqlx::query(
                "INSERT INTO required_reporting_information (version_id, information_type, description, is_required) \
                 VALUES ($1, $2, $2, TRUE)",
            )
            .bind(id)
            .bind(info)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        Ok(written)
    }

    async fn insert_reference(&self, conn: &mut PgConnection, id: i64, version: &RecordkeepingVersion) -> Result<u64> {
        let mut written = 0;

        for definition in &version.definitions {
            sqlx::query(
                "INSERT INTO regulatory_definitions (version_id, term, regulation_ref, definition_type, definition_text) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(&definition.term)
            .bind(&definition.regulation_ref)
            .bind(&definition.definition_type)
            .bind(&definition.text)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        for treatment in &version.first_aid {
            sqlx::query(
                "INSERT INTO first_aid_treatments (version_id, treatment_name, treatment_details, exceptions) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(&treatment.name)
            .bind(&treatment.details)
            .bind(&treatment.exception)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        Ok(written)
    }
}

#[async_trait]
impl RecordMapper for Cfr1904Mapper {
    type Record = RecordkeepingVersion;

    fn table(&self) -> &'static str {
        "regulation_versions"
    }

    async fn insert_version(&self, conn: &mut PgConnection, doc: &Document<RecordkeepingVersion>) -> Result<i64> {
        let record = &doc.record;
        demote_other_current(conn, self.table(), "regulation_id", &record.regulation_id, None).await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO regulation_versions (
                logical_key, content_hash, is_current, regulation_id, version_number,
                effective_date, last_updated, source_url, created_by
            ) VALUES ($1, $2, TRUE, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&doc.logical_key)
        .bind(&doc.content_hash)
        .bind(&record.regulation_id)
        .bind(&record.version_number)
        .bind(record.effective_date)
        .bind(record.last_updated)
        .bind(&record.source_url)
        .bind(&self.created_by)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn update_version(
        &self,
        conn: &mut PgConnection,
        id: i64,
        doc: &Document<RecordkeepingVersion>,
    ) -> Result<()> {
        let record = &doc.record;
        demote_other_current(conn, self.table(), "regulation_id", &record.regulation_id, Some(id)).await?;

        let result = sqlx::query(
            r#"
            UPDATE regulation_versions SET
                content_hash = $2, is_current = TRUE, effective_date = $3, last_updated = $4,
                source_url = $5, parsing_date = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&doc.content_hash)
        .bind(record.effective_date)
        .bind(record.last_updated)
        .bind(&record.source_url)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::record(&doc.logical_key, format!("version row {id} no longer exists")));
        }
        Ok(())
    }

    async fn write_children(
        &self,
        conn: &mut PgConnection,
        id: i64,
        doc: &Document<RecordkeepingVersion>,
    ) -> Result<u64> {
        let version = &doc.record;
        let mut written = 0;

        for citation in &version.authorities {
            sqlx::query("INSERT INTO regulation_authorities (version_id, authority_type, citation) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(AuthorityType::of(citation).as_str())
                .bind(citation)
                .execute(&mut *conn)
                .await?;
            written += 1;
        }

        for amendment in &version.amendments {
            sqlx::query(
                "INSERT INTO regulation_amendments (version_id, amendment_date, federal_register_citation, \
                     amendment_type, description) VALUES ($1, $2, $3, 'modification', $4)",
            )
            .bind(id)
            .bind(amendment.date)
            .bind(&amendment.citation)
            .bind(&amendment.description)
            .execute(&mut *conn)
            .await?;
            written += 1;
        }

        written += self.insert_applicability(conn, id, version).await?;
        written += self.insert_recording_criteria(conn, id, version).await?;
        written += self.insert_forms(conn, id, version).await?;
        written += self.insert_reporting(conn, id, version).await?;
        written += self.insert_reference(conn, id, version).await?;
        Ok(written)
    }

    /// Nested rows (exceptions, methods, form details) go with their parents
    async fn delete_children(&self, conn: &mut PgConnection, id: i64) -> Result<u64> {
        let mut removed = 0;
        for table in VERSION_TABLES {
            let sql = format!("DELETE FROM {table} WHERE version_id = $1");
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
            "regulation_metadata": {
                "regulation_id": "29_CFR_1904",
                "effective_date": "2002-01-01",
                "parsing_version": "v3.0",
                "legal_basis": ["29 U.S.C. 657", "29 CFR 1904.0", "Secretary's Order 8-2020"],
                "editorial_notes": [{ "date": "2001-01-19", "citation": "66 FR 6122" }]
            },
            "company_applicability": {
                "size_exemptions": [
                    { "condition": "25 or fewer employees during the year", "exceptions": [{ "exception_type": "survey" }] },
                    { "condition": "a small company" }
                ],
                "industry_exemptions": [
                    { "naics_codes": ["5111", { "code": "4412", "industry": "Boat Dealers" }, { "industry": "no code" }] }
                ],
                "reference_data": {
                    "naics_codes": {
                        "appendix_b_designated": [{ "naics_code": "2361", "industry": "Residential" }],
                        "state_plan_extra": ["9999"]
                    }
                }
            },
            "recording_criteria": {
                "specific_recording_criteria": {
                    "needlestick": { "privacy_protection": "may_not_enter_employee_name_use_privacy_case_procedures" },
                    "hearing_loss": { "privacy_protection": "none" }
                }
            },
            "form_requirements": {
                "required_forms": ["300A", { "form_id": "301", "required_information": ["employee", "case"] }],
                "privacy_protections": {
                    "complete_list_privacy_concern_cases": ["sexual_assault"],
                    "privacy_case_procedures": { "log_entry": "privacy case" }
                }
            },
            "ongoing_obligations": {},
            "government_reporting": {
                "immediate_reporting": [{ "trigger": "fatality", "reporting_methods": ["phone", "online"] }],
                "required_information": ["establishment name"]
            },
            "reference_data": {
                "definitions": {
                    "establishment": "A single physical location",
                    "first_aid": {
                        "completeness_note": "complete list",
                        "items": [{ "treatment": "Bandages" }]
                    },
                    "medical_treatment": { "basic_definition": "Managing and caring for a patient", "definition_type": "basic" }
                }
            }
        })
    }

    fn version(raw: Value) -> RecordkeepingVersion {
        match parse(raw, "cfr_1904.json").unwrap().remove(0) {
            Parsed::Ready(doc) => doc.record,
            Parsed::Rejected { error, .. } => panic!("rejected: {error}"),
        }
    }

    #[test]
    fn test_parse_uses_the_shared_version_key() {
        let docs = parse(sample(), "cfr_1904.json").unwrap();
        assert_eq!(docs[0].key(), "29_CFR_1904:v3.0");
    }

    #[test]
    fn test_authority_types() {
        assert_eq!(AuthorityType::of("29 U.S.C. 657"), AuthorityType::Usc);
        assert_eq!(AuthorityType::of("29 CFR 1904.0"), AuthorityType::Cfr);
        assert_eq!(AuthorityType::of("Secretary's Order 8-2020"), AuthorityType::Other);
    }

    #[test]
    fn test_size_exemption_threshold_from_condition() {
        let v = version(sample());
        let thresholds: Vec<i32> = v.size_exemptions.iter().map(|e| e.employee_threshold).collect();
        assert_eq!(thresholds, [25, DEFAULT_EMPLOYEE_THRESHOLD]);
        assert_eq!(v.size_exemptions[0].exceptions.len(), 1);
    }

    #[test]
    fn test_naics_codes_from_exemptions_and_appendices() {
        let v = version(sample());
        let codes: Vec<(&str, &str, &str)> = v
            .naics_codes
            .iter()
            .map(|n| (n.code.as_str(), n.exemption_type.as_str(), n.appendix))
            .collect();
        assert_eq!(
            codes,
            [
                ("5111", "partial_exemption", "A"),
                ("4412", "partial_exemption", "A"),
                ("2361", "b_designated", "B"),
                ("9999", "state_plan_extra", "Other"),
            ]
        );
        assert_eq!(v.naics_codes[1].industry.as_deref(), Some("Boat Dealers"));
    }

    #[test]
    fn test_forms_privacy_and_reporting() {
        let v = version(sample());
        assert_eq!(v.forms[0].form_id.as_deref(), Some("300A"));
        assert_eq!(v.forms[1].required_information, ["employee", "case"]);
        assert_eq!(v.privacy_cases[0].description, "Sexual Assault");
        assert_eq!(v.privacy_cases[0].handling.as_deref(), Some("privacy case"));
        assert_eq!(v.immediate_reports[0].methods.len(), 2);
        assert_eq!(v.reporting_information, ["establishment name"]);

        let privacy: Vec<(&str, bool)> = v
            .specific_criteria
            .iter()
            .map(|c| (c.criterion_type.as_str(), c.privacy_protection_required))
            .collect();
        assert_eq!(privacy, [("hearing_loss", false), ("needlestick", true)]);
    }

    #[test]
    fn test_definition_text_fallbacks() {
        let v = version(sample());
        let texts: Vec<(&str, &str)> = v.definitions.iter().map(|d| (d.term.as_str(), d.text.as_str())).collect();
        assert_eq!(
            texts,
            [
                ("establishment", "A single physical location"),
                ("first_aid", "complete list"),
                ("medical_treatment", "Managing and caring for a patient"),
            ]
        );
        assert_eq!(v.definitions[0].definition_type.as_deref(), Some("basic_definition"));
        assert_eq!(v.first_aid.len(), 1);
    }

    #[test]
    fn test_missing_sections_load_nothing_for_them() {
        let mut raw = sample();
        raw["recording_criteria"] = json!({});
        let v = version(raw);
        assert!(v.work_relatedness.is_none());
        assert!(v.decision_steps.is_empty());
        assert!(v.specific_criteria.is_empty());
    }

    #[test]
    fn test_child_row_total() {
        let v = version(sample());
        // 3 authorities, 1 amendment, 2 exemptions + 1 exception, 4 naics,
        // 2 specific criteria, 2 forms + 2 details, 1 privacy case,
        // 1 report + 2 methods, 1 reporting item, 3 definitions, 1 treatment
        assert_eq!(v.child_rows(), 26);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("mental_illness"), "Mental Illness");
        assert_eq!(title_case("HIV_infection"), "Hiv Infection");
    }

    #[test]
    fn test_unreadable_effective_date_rejects_the_document() {
        let mut raw = sample();
        raw["regulation_metadata"]["effective_date"] = json!("someday");
        let docs = parse(raw, "cfr_1904.json").unwrap();
        assert!(matches!(&docs[0], Parsed::Rejected { key, .. } if key == "29_CFR_1904:v3.0"));
    }
}
