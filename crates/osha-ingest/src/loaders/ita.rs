//! Injury Tracking Application (ITA) loader
//!
//! ITA extracts are CSV files or workbooks whose sheets hold either Form 300A
//! summaries or Form 300/301 case details. Every row upserts its
//! establishment and becomes one versioned summary or case row. Data year
//! comes from `--year`, else the file path, else the current year.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row as _};
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{LoadContext, LoaderRun};
use crate::coerce::{
    coerce_bool, coerce_date, coerce_float, coerce_i32, coerce_int, coerce_string, coerce_time,
    coerce_timestamp, extract_year_from_path,
};
use crate::error::{IngestError, Result};
use crate::framework::{Document, PgVersionStore, RecordMapper, VersionStore, VersionedLoader};
use crate::source::{collect_source_files, read_tabular, Row, Sheet, TABULAR_EXTENSIONS};

pub const LOAD_TYPE: &str = "ita";

const SUMMARY_INDICATORS: [&str; 6] = [
    "annual_average_employees",
    "total_hours_worked",
    "total_deaths",
    "total_dafw_cases",
    "total_djtr_cases",
    "total_injuries",
];

const CASE_INDICATORS: [&str; 5] = [
    "case_number",
    "date_of_incident",
    "incident_outcome",
    "type_of_incident",
    "job_description",
];

/// Indicator columns a sheet needs to be classified
const MIN_INDICATORS: usize = 3;

const DEFAULT_NAICS_YEAR: i32 = 2012;

const DEFAULT_ESTABLISHMENT_TYPE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetKind {
    Summary300A,
    CaseDetail,
}

impl SheetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetKind::Summary300A => "300A summary",
            SheetKind::CaseDetail => "case detail",
        }
    }
}

/// Decide what a sheet holds from its (normalized) column names
pub fn classify(columns: &[String]) -> Option<SheetKind> {
    let hits = |indicators: &[&str]| {
        indicators
            .iter()
            .filter(|i| columns.iter().any(|c| c == *i))
            .count()
    };
    if hits(&SUMMARY_INDICATORS) >= MIN_INDICATORS {
        Some(SheetKind::Summary300A)
    } else if hits(&CASE_INDICATORS) >= MIN_INDICATORS {
        Some(SheetKind::CaseDetail)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItaOptions {
    /// Data year for every file, overriding the path
    pub year: Option<i32>,
    pub recursive: bool,
}

impl Default for ItaOptions {
    fn default() -> Self {
        Self {
            year: None,
            recursive: true,
        }
    }
}

pub fn data_year(path: &Path, year: Option<i32>) -> i32 {
    year.or_else(|| extract_year_from_path(path))
        .unwrap_or_else(|| Utc::now().year())
}

fn text(row: &Row, column: &str) -> Option<String> {
    coerce_string(row.get(column))
}

/// Establishment columns shared by both sheet kinds
#[derive(Debug, Clone, PartialEq)]
pub struct Establishment {
    pub establishment_id: Option<i64>,
    pub establishment_name: Option<String>,
    pub ein: Option<String>,
    pub company_name: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state_code: Option<String>,
    pub zip_code: Option<String>,
    pub naics_code: Option<String>,
    pub naics_year: i32,
    pub industry_description: Option<String>,
    pub establishment_type: i32,
    pub size_category: Option<i32>,
}

impl Establishment {
    pub fn from_row(row: &Row) -> Self {
        Self {
            establishment_id: coerce_int(row.get("establishment_id")),
            establishment_name: text(row, "establishment_name"),
            ein: text(row, "ein"),
            company_name: text(row, "company_name"),
            street_address: text(row, "street_address"),
            city: text(row, "city"),
            state_code: text(row, "state"),
            zip_code: text(row, "zip_code"),
            naics_code: text(row, "naics_code"),
            naics_year: coerce_i32(row.get("naics_year")).unwrap_or(DEFAULT_NAICS_YEAR),
            industry_description: text(row, "industry_description"),
            establishment_type: coerce_i32(row.get("establishment_type"))
                .unwrap_or(DEFAULT_ESTABLISHMENT_TYPE),
            size_category: coerce_i32(row.get("size")),
        }
    }

    /// Natural key the establishment is upserted on
    ///
    /// EIN plus name when both are known, else the ITA establishment id, else
    /// name plus ZIP code.
    pub fn identity_key(&self) -> Option<String> {
        match (&self.ein, &self.establishment_name, self.establishment_id, &self.zip_code) {
            (Some(ein), Some(name), _, _) => Some(format!("ein:{ein}|{name}")),
            (_, _, Some(id), _) => Some(format!("ita:{id}")),
            (_, Some(name), None, Some(zip)) => Some(format!("name:{name}|{zip}")),
            _ => None,
        }
    }

    pub fn address(&self) -> Value {
        json!({
            "street_address": self.street_address,
            "city": self.city,
            "state": self.state_code,
            "zip_code": self.zip_code,
        })
    }

    pub fn naics(&self) -> Value {
        json!({
            "code": self.naics_code,
            "year": self.naics_year,
            "description": self.industry_description,
        })
    }

    /// Establishment as filed for `year`, frozen onto each summary or case row
    pub fn snapshot(&self, year: i32) -> Value {
        json!({
            "establishment_name": self.establishment_name,
            "company_name": self.company_name,
            "address": {
                "street": self.street_address,
                "city": self.city,
                "state": self.state_code,
                "zip": self.zip_code,
            },
            "naics": self.naics(),
            "filing_year": year,
        })
    }
}

/// Establishment fields plus where they were seen
#[derive(Debug, Clone)]
pub struct Filing {
    pub establishment: Establishment,
    pub establishment_key: String,
    pub year: i32,
    /// Audit row of the file; `None` when none was written
    pub load_id: Option<Uuid>,
    pub ita_id: Option<i64>,
    pub created_timestamp: Option<String>,
    pub ita_created_at: Option<NaiveDateTime>,
    pub source: Value,
}

impl Filing {
    fn from_row(row: &Row, year: i32, load_id: Option<Uuid>, row_label: &str) -> Result<Self> {
        let establishment = Establishment::from_row(row);
        let establishment_key = establishment
            .identity_key()
            .ok_or_else(|| IngestError::record(row_label, "no establishment identity (ein, name or id)"))?;
        Ok(Self {
            establishment,
            establishment_key,
            year,
            load_id,
            ita_id: coerce_int(row.get("id")),
            created_timestamp: text(row, "created_timestamp"),
            ita_created_at: coerce_timestamp(row.get("created_timestamp")),
            source: Value::Object(row.clone()),
        })
    }

    /// ITA row id when present, else the establishment
    fn subject(&self) -> String {
        match (self.ita_id, self.establishment.establishment_id) {
            (Some(id), _) => id.to_string(),
            (None, Some(est)) => format!("est-{est}"),
            (None, None) => self.establishment_key.clone(),
        }
    }
}

/// Total columns of Form 300A, all defaulting to zero
pub const SUMMARY_TOTALS: [&str; 12] = [
    "total_deaths",
    "total_dafw_cases",
    "total_djtr_cases",
    "total_other_cases",
    "total_dafw_days",
    "total_djtr_days",
    "total_injuries",
    "total_skin_disorders",
    "total_respiratory_conditions",
    "total_poisonings",
    "total_hearing_loss",
    "total_other_illnesses",
];

#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub filing: Filing,
    pub annual_average_employees: Option<i64>,
    pub total_hours_worked: Option<i64>,
    pub no_injuries_illnesses: Option<i64>,
    /// In [`SUMMARY_TOTALS`] order
    pub totals: [i64; 12],
    pub change_reason: Option<String>,
    pub sector: Option<String>,
    pub zipcode: Option<String>,
    pub naics_char: Option<String>,
}

impl SummaryRecord {
    pub fn from_row(row: &Row, year: i32, load_id: Option<Uuid>, row_label: &str) -> Result<Self> {
        let filing = Filing::from_row(row, year, load_id, row_label)?;
        Ok(Self {
            filing,
            annual_average_employees: coerce_int(row.get("annual_average_employees")),
            total_hours_worked: coerce_int(row.get("total_hours_worked")),
            no_injuries_illnesses: coerce_int(row.get("no_injuries_illnesses")),
            totals: SUMMARY_TOTALS.map(|column| coerce_int(row.get(column)).unwrap_or(0)),
            change_reason: text(row, "change_reason"),
            sector: text(row, "sector"),
            zipcode: text(row, "zipcode"),
            naics_char: text(row, "naics_char"),
        })
    }

    pub fn logical_key(&self) -> String {
        format!("300a:{}:{}", self.filing.subject(), self.filing.year)
    }

    /// Versioned document hashed over the source row
    pub fn into_document(self) -> Document<Self> {
        let source = self.filing.source.clone();
        Document::new(self.logical_key(), &source, self)
    }
}

#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub filing: Filing,
    pub case_number: Option<String>,
    pub job_description: Option<String>,
    pub soc_code: Option<String>,
    pub soc_description: Option<String>,
    pub soc_reviewed: Option<i32>,
    pub soc_probability: Option<f64>,
    pub date_of_incident: Option<NaiveDate>,
    pub time_started_work: Option<NaiveTime>,
    pub time_of_incident: Option<NaiveTime>,
    pub time_unknown: bool,
    pub incident_outcome: Option<i32>,
    pub type_of_incident: Option<i32>,
    pub dafw_num_away: Option<i32>,
    pub djtr_num_tr: Option<i32>,
    pub date_of_death: Option<NaiveDate>,
    pub incident_location: Option<String>,
    pub incident_description: Option<String>,
    pub narrative_before_incident: Option<String>,
    pub narrative_what_happened: Option<String>,
    pub narrative_injury_illness: Option<String>,
    pub narrative_object_substance: Option<String>,
}

impl CaseRecord {
    pub fn from_row(row: &Row, year: i32, load_id: Option<Uuid>, row_label: &str) -> Result<Self> {
        let filing = Filing::from_row(row, year, load_id, row_label)?;
        let case_number = text(row, "case_number");
        if filing.ita_id.is_none() && case_number.is_none() {
            return Err(IngestError::record(row_label, "case has neither an id nor a case number"));
        }
        Ok(Self {
            filing,
            case_number,
            job_description: text(row, "job_description"),
            soc_code: text(row, "soc_code"),
            soc_description: text(row, "soc_description"),
            soc_reviewed: coerce_i32(row.get("soc_reviewed")),
            soc_probability: coerce_float(row.get("soc_probability")),
            date_of_incident: coerce_date(row.get("date_of_incident")),
            time_started_work: coerce_time(row.get("time_started_work")),
            time_of_incident: coerce_time(row.get("time_of_incident")),
            time_unknown: coerce_bool(row.get("time_unknown")).unwrap_or(false),
            incident_outcome: coerce_i32(row.get("incident_outcome")),
            type_of_incident: coerce_i32(row.get("type_of_incident")),
            dafw_num_away: coerce_i32(row.get("dafw_num_away")),
            djtr_num_tr: coerce_i32(row.get("djtr_num_tr")),
            date_of_death: coerce_date(row.get("date_of_death")),
            incident_location: text(row, "new_incident_location"),
            incident_description: text(row, "new_incident_description"),
            narrative_before_incident: text(row, "new_nar_before_incident"),
            narrative_what_happened: text(row, "new_nar_what_happened"),
            narrative_injury_illness: text(row, "new_nar_injury_illness"),
            narrative_object_substance: text(row, "new_nar_object_substance"),
        })
    }

    pub fn logical_key(&self) -> String {
        match (self.filing.ita_id, &self.case_number) {
            (Some(id), _) => format!("case:{id}:{}", self.filing.year),
            (None, case_number) => format!(
                "case:{}:{}:{}",
                self.filing.subject(),
                case_number.as_deref().unwrap_or_default(),
                self.filing.year
            ),
        }
    }

    pub fn into_document(self) -> Document<Self> {
        let source = self.filing.source.clone();
        Document::new(self.logical_key(), &source, self)
    }

    pub fn narratives(&self) -> Value {
        json!({
            "location": self.incident_location,
            "description": self.incident_description,
            "before_incident": self.narrative_before_incident,
            "what_happened": self.narrative_what_happened,
            "injury_illness": self.narrative_injury_illness,
            "object_substance": self.narrative_object_substance,
        })
    }
}

/// Insert or refresh an establishment, returning its uuid
///
/// Name and EIN follow the most recent filing year seen; an older file
/// loaded later leaves them alone.
async fn upsert_establishment(conn: &mut PgConnection, filing: &Filing) -> Result<Uuid> {
    let est = &filing.establishment;
    let row = sqlx::query(
        r#"
        INSERT INTO establishments (
            establishment_uuid, establishment_key, establishment_id, establishment_name, ein,
            company_name, current_address, street_address, city, state_code, zip_code,
            current_naics, primary_naics_code, naics_year, industry_description,
            establishment_type, size_category, first_seen_year, last_seen_year
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $18)
        ON CONFLICT (establishment_key) DO UPDATE SET
            establishment_id = COALESCE(EXCLUDED.establishment_id, establishments.establishment_id),
            establishment_name = CASE
                WHEN EXCLUDED.last_seen_year >= establishments.last_seen_year
                THEN COALESCE(EXCLUDED.establishment_name, establishments.establishment_name)
                ELSE establishments.establishment_name
            END,
            ein = CASE
                WHEN EXCLUDED.last_seen_year >= establishments.last_seen_year
                THEN COALESCE(EXCLUDED.ein, establishments.ein)
                ELSE establishments.ein
            END,
            company_name = COALESCE(EXCLUDED.company_name, establishments.company_name),
            current_address = EXCLUDED.current_address,
            street_address = EXCLUDED.street_address,
            city = EXCLUDED.city,
            state_code = EXCLUDED.state_code,
            zip_code = EXCLUDED.zip_code,
            current_naics = EXCLUDED.current_naics,
            primary_naics_code = EXCLUDED.primary_naics_code,
            naics_year = EXCLUDED.naics_year,
            industry_description = EXCLUDED.industry_description,
            establishment_type = EXCLUDED.establishment_type,
            size_category = EXCLUDED.size_category,
            first_seen_year = LEAST(establishments.first_seen_year, EXCLUDED.first_seen_year),
            last_seen_year = GREATEST(establishments.last_seen_year, EXCLUDED.last_seen_year),
            updated_at = NOW()
        RETURNING establishment_uuid
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&filing.establishment_key)
    .bind(est.establishment_id)
    .bind(&est.establishment_name)
    .bind(&est.ein)
    .bind(&est.company_name)
    .bind(est.address())
    .bind(&est.street_address)
    .bind(&est.city)
    .bind(&est.state_code)
    .bind(&est.zip_code)
    .bind(est.naics())
    .bind(&est.naics_code)
    .bind(est.naics_year)
    .bind(&est.industry_description)
    .bind(est.establishment_type)
    .bind(est.size_category)
    .bind(filing.year)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.try_get("establishment_uuid")?)
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Bind `$3` onward of a summary insert or update
fn bind_summary<'q>(query: PgQuery<'q>, record: &'q SummaryRecord, establishment_uuid: Uuid) -> PgQuery<'q> {
    let filing = &record.filing;
    let mut query = query
        .bind(establishment_uuid)
        .bind(filing.load_id)
        .bind(filing.ita_id)
        .bind(filing.establishment.establishment_id)
        .bind(filing.establishment.snapshot(filing.year))
        .bind(record.annual_average_employees)
        .bind(record.total_hours_worked)
        .bind(record.no_injuries_illnesses);
    for total in record.totals {
        query = query.bind(total);
    }
    query
        .bind(filing.year)
        .bind(&filing.created_timestamp)
        .bind(filing.ita_created_at)
        .bind(&record.change_reason)
        .bind(&record.sector)
        .bind(&record.zipcode)
        .bind(&record.naics_char)
        .bind(&filing.source)
}

pub struct SummaryMapper;

#[async_trait]
impl RecordMapper for SummaryMapper {
    type Record = SummaryRecord;

    fn table(&self) -> &'static str {
        "summary_300a_data"
    }

    async fn insert_version(&self, conn: &mut PgConnection, doc: &Document<SummaryRecord>) -> Result<i64> {
        let establishment_uuid = upsert_establishment(conn, &doc.record.filing).await?;
        let query = sqlx::query(
            r#"
            INSERT INTO summary_300a_data (
                logical_key, content_hash, is_current, establishment_uuid, load_id, ita_id,
                ita_establishment_id, establishment_snapshot, annual_average_employees,
                total_hours_worked, no_injuries_illnesses, total_deaths, total_dafw_cases,
                total_djtr_cases, total_other_cases, total_dafw_days, total_djtr_days,
                total_injuries, total_skin_disorders, total_respiratory_conditions,
                total_poisonings, total_hearing_loss, total_other_illnesses, year_filing_for,
                created_timestamp, ita_created_at, change_reason, sector, zipcode, naics_char,
                source_data
            ) VALUES (
                $1, $2, TRUE, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30
            )
            RETURNING id
            "#,
        )
        .bind(&doc.logical_key)
        .bind(&doc.content_hash);
        let row = bind_summary(query, &doc.record, establishment_uuid)
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn update_version(&self, conn: &mut PgConnection, id: i64, doc: &Document<SummaryRecord>) -> Result<()> {
        let establishment_uuid = upsert_establishment(conn, &doc.record.filing).await?;
        let query = sqlx::query(
            r#"
            UPDATE summary_300a_data SET
                content_hash = $2, is_current = TRUE, establishment_uuid = $3, load_id = $4,
                ita_id = $5, ita_establishment_id = $6, establishment_snapshot = $7,
                annual_average_employees = $8, total_hours_worked = $9,
                no_injuries_illnesses = $10, total_deaths = $11, total_dafw_cases = $12,
                total_djtr_cases = $13, total_other_cases = $14, total_dafw_days = $15,
                total_djtr_days = $16, total_injuries = $17, total_skin_disorders = $18,
                total_respiratory_conditions = $19, total_poisonings = $20,
                total_hearing_loss = $21, total_other_illnesses = $22, year_filing_for = $23,
                created_timestamp = $24, ita_created_at = $25, change_reason = $26,
                sector = $27, zipcode = $28, naics_char = $29, source_data = $30,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&doc.content_hash);
        let result = bind_summary(query, &doc.record, establishment_uuid)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(IngestError::record(&doc.logical_key, format!("summary row {id} no longer exists")));
        }
        Ok(())
    }
}

/// Bind `$3` onward of a case insert or update
fn bind_case<'q>(query: PgQuery<'q>, record: &'q CaseRecord, establishment_uuid: Uuid) -> PgQuery<'q> {
    let filing = &record.filing;
    query
        .bind(establishment_uuid)
        .bind(filing.load_id)
        .bind(filing.ita_id)
        .bind(filing.establishment.establishment_id)
        .bind(&record.case_number)
        .bind(filing.establishment.snapshot(filing.year))
        .bind(&record.job_description)
        .bind(&record.soc_code)
        .bind(&record.soc_description)
        .bind(record.soc_reviewed)
        .bind(record.soc_probability)
        .bind(record.date_of_incident)
        .bind(record.time_started_work)
        .bind(record.time_of_incident)
        .bind(record.time_unknown)
        .bind(record.incident_outcome)
        .bind(record.type_of_incident)
        .bind(record.dafw_num_away)
        .bind(record.djtr_num_tr)
        .bind(record.date_of_death)
        .bind(&record.incident_location)
        .bind(&record.incident_description)
        .bind(&record.narrative_before_incident)
        .bind(&record.narrative_what_happened)
        .bind(&record.narrative_injury_illness)
        .bind(&record.narrative_object_substance)
        .bind(record.narratives())
        .bind(filing.year)
        .bind(&filing.created_timestamp)
        .bind(filing.ita_created_at)
        .bind(&filing.source)
}

pub struct CaseMapper;

#[async_trait]
impl RecordMapper for CaseMapper {
    type Record = CaseRecord;

    fn table(&self) -> &'static str {
        "case_detail_data"
    }

    async fn insert_version(&self, conn: &mut PgConnection, doc: &Document<CaseRecord>) -> Result<i64> {
        let establishment_uuid = upsert_establishment(conn, &doc.record.filing).await?;
        let query = sqlx::query(
            r#"
            INSERT INTO case_detail_data (
                logical_key, content_hash, is_current, establishment_uuid, load_id, ita_id,
                ita_establishment_id, case_number, establishment_snapshot, job_description,
                soc_code, soc_description, soc_reviewed, soc_probability, date_of_incident,
                time_started_work, time_of_incident, time_unknown, incident_outcome,
                type_of_incident, dafw_num_away, djtr_num_tr, date_of_death, incident_location,
                incident_description, narrative_before_incident, narrative_what_happened,
                narrative_injury_illness, narrative_object_substance, incident_narratives,
                year_filing_for, created_timestamp, ita_created_at, source_data
            ) VALUES (
                $1, $2, TRUE, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31,
                $32, $33
            )
            RETURNING id
            "#,
        )
        .bind(&doc.logical_key)
        .bind(&doc.content_hash);
        let row = bind_case(query, &doc.record, establishment_uuid)
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn update_version(&self, conn: &mut PgConnection, id: i64, doc: &Document<CaseRecord>) -> Result<()> {
        let establishment_uuid = upsert_establishment(conn, &doc.record.filing).await?;
        let query = sqlx::query(
            r#"
            UPDATE case_detail_data SET
                content_hash = $2, is_current = TRUE, establishment_uuid = $3, load_id = $4,
                ita_id = $5, ita_establishment_id = $6, case_number = $7,
                establishment_snapshot = $8, job_description = $9, soc_code = $10,
                soc_description = $11, soc_reviewed = $12, soc_probability = $13,
                date_of_incident = $14, time_started_work = $15, time_of_incident = $16,
                time_unknown = $17, incident_outcome = $18, type_of_incident = $19,
                dafw_num_away = $20, djtr_num_tr = $21, date_of_death = $22,
                incident_location = $23, incident_description = $24,
                narrative_before_incident = $25, narrative_what_happened = $26,
                narrative_injury_illness = $27, narrative_object_substance = $28,
                incident_narratives = $29, year_filing_for = $30, created_timestamp = $31,
                ita_created_at = $32, source_data = $33, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&doc.content_hash);
        let result = bind_case(query, &doc.record, establishment_uuid)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(IngestError::record(&doc.logical_key, format!("case row {id} no longer exists")));
        }
        Ok(())
    }
}

/// One input file, read and classified
struct ItaFile {
    path: PathBuf,
    year: i32,
    sheets: Vec<(SheetKind, Sheet)>,
}

fn row_label(sheet: &Sheet, index: usize) -> String {
    // header is line 1
    format!("{}:row {}", sheet.name, index + 2)
}

async fn load_sheet<M, F>(
    loader: &mut VersionedLoader<PgVersionStore<M>>,
    sheet: &Sheet,
    to_document: F,
) -> Result<()>
where
    M: RecordMapper,
    F: Fn(&Row, &str) -> Result<Document<M::Record>>,
{
    info!(sheet = %sheet.name, rows = sheet.rows.len(), table = loader.store().table(), "Loading sheet");
    for (index, row) in sheet.rows.iter().enumerate() {
        let label = row_label(sheet, index);
        match to_document(row, &label) {
            Ok(doc) => {
                loader.load_document(doc).await?;
            },
            Err(err) => loader.reject(&label, err)?,
        }
    }
    Ok(())
}

/// Row counts after the load, reported as notes
pub async fn integrity_check(pool: &PgPool) -> Result<Vec<String>> {
    let (establishments, summaries, cases, years): (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM establishments),
            (SELECT COUNT(*) FROM summary_300a_data WHERE is_current),
            (SELECT COUNT(*) FROM case_detail_data WHERE is_current),
            (SELECT COUNT(DISTINCT year_filing_for) FROM summary_300a_data WHERE is_current)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(vec![
        format!("establishments on record: {establishments}"),
        format!("current 300A summaries: {summaries}"),
        format!("current case details: {cases}"),
        format!("filing years with summaries: {years}"),
    ])
}

pub async fn run(ctx: &mut LoadContext, path: &Path, options: ItaOptions) -> Result<LoaderRun> {
    let mut run = LoaderRun::default();

    let mut files = Vec::new();
    for file in collect_source_files(path, options.recursive, &TABULAR_EXTENSIONS)? {
        let year = data_year(&file, options.year);
        let mut sheets = Vec::new();
        for sheet in read_tabular(&file)? {
            match classify(&sheet.columns) {
                Some(kind) => sheets.push((kind, sheet)),
                None => {
                    warn!(file = %file.display(), sheet = %sheet.name, "Unrecognized sheet, skipping");
                    run.notes.push(format!("skipped unrecognized sheet '{}' in {}", sheet.name, file.display()));
                },
            }
        }
        files.push(ItaFile { path: file, year, sheets });
    }
    info!(files = files.len(), "ITA input validated");

    let mut summaries = VersionedLoader::new(PgVersionStore::new(ctx.pool.clone(), SummaryMapper), ctx.options);
    let mut cases = VersionedLoader::new(PgVersionStore::new(ctx.pool.clone(), CaseMapper), ctx.options);
    summaries.prepare().await?;
    cases.prepare().await?;

    for file in files {
        let audit = ctx.start_file(&file.path, LOAD_TYPE, Some(file.year)).await?;
        let load_id = audit.persisted.then_some(audit.load_id);
        let year = file.year;
        let span = info_span!("load", load_type = LOAD_TYPE, file = %audit.source_file_name, year);

        let outcome = async {
            for (kind, sheet) in &file.sheets {
                match kind {
                    SheetKind::Summary300A => {
                        load_sheet(&mut summaries, sheet, |row, label| {
                            Ok(SummaryRecord::from_row(row, year, load_id, label)?.into_document())
                        })
                        .await?
                    },
                    SheetKind::CaseDetail => {
                        load_sheet(&mut cases, sheet, |row, label| {
                            Ok(CaseRecord::from_row(row, year, load_id, label)?.into_document())
                        })
                        .await?
                    },
                }
            }
            Ok::<_, IngestError>(())
        }
        .instrument(span)
        .await;

        let stats = vec![summaries.finish_file(), cases.finish_file()];
        run.files.push(ctx.finish_file(&audit, &file.path, outcome, stats).await?);
    }

    run.tables = vec![summaries.into_stats(), cases.into_stats()];
    if ctx.options.persists() {
        run.notes.extend(integrity_check(&ctx.pool).await?);
    }
    Ok(run)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::compute_content_hash;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_sheets() {
        assert_eq!(
            classify(&columns(&["establishment_name", "total_deaths", "total_injuries", "total_hours_worked"])),
            Some(SheetKind::Summary300A)
        );
        assert_eq!(
            classify(&columns(&["case_number", "date_of_incident", "job_description"])),
            Some(SheetKind::CaseDetail)
        );
        assert_eq!(classify(&columns(&["field", "description", "total_deaths"])), None);
    }

    #[test]
    fn test_data_year_precedence() {
        let path = Path::new("/data/ITA Data CY 2023/summary.csv");
        assert_eq!(data_year(path, Some(2019)), 2019);
        assert_eq!(data_year(path, None), 2023);
        assert_eq!(data_year(Path::new("/data/summary.csv"), None), Utc::now().year());
    }

    #[test]
    fn test_establishment_defaults_and_identity() {
        let est = Establishment::from_row(&row(&[
            ("establishment_name", json!("Acme Roofing")),
            ("ein", json!("12-3456789")),
            ("state", json!("TX")),
            ("size", json!("2")),
        ]));
        assert_eq!(est.naics_year, DEFAULT_NAICS_YEAR);
        assert_eq!(est.establishment_type, DEFAULT_ESTABLISHMENT_TYPE);
        assert_eq!(est.size_category, Some(2));
        assert_eq!(est.state_code.as_deref(), Some("TX"));
        assert_eq!(est.identity_key().as_deref(), Some("ein:12-3456789|Acme Roofing"));

        let by_id = Establishment::from_row(&row(&[("establishment_id", json!(88121.0))]));
        assert_eq!(by_id.identity_key().as_deref(), Some("ita:88121"));

        let by_name = Establishment::from_row(&row(&[
            ("establishment_name", json!("Beta Steel")),
            ("zip_code", json!("77001")),
        ]));
        assert_eq!(by_name.identity_key().as_deref(), Some("name:Beta Steel|77001"));

        assert_eq!(Establishment::from_row(&row(&[("city", json!("Austin"))])).identity_key(), None);
    }

    #[test]
    fn test_summary_record_maps_totals() {
        let record = SummaryRecord::from_row(
            &row(&[
                ("id", json!("501")),
                ("establishment_name", json!("Acme Roofing")),
                ("ein", json!("12-3456789")),
                ("annual_average_employees", json!("42.0")),
                ("total_deaths", json!("1")),
                ("total_injuries", json!(3)),
                ("created_timestamp", json!("01JAN25:15:03:00")),
            ]),
            2024,
            None,
            "summary:row 2",
        )
        .unwrap();

        assert_eq!(record.logical_key(), "300a:501:2024");
        assert_eq!(record.annual_average_employees, Some(42));
        assert_eq!(record.total_hours_worked, None);
        assert_eq!(record.totals[0], 1);
        assert_eq!(record.totals[6], 3);
        assert_eq!(record.totals[11], 0);
        assert_eq!(
            record.filing.ita_created_at,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(15, 3, 0)
        );
    }

    #[test]
    fn test_into_document_hashes_source_row() {
        let source = row(&[
            ("id", json!("77")),
            ("establishment_id", json!(12)),
            ("case_number", json!("2024-009")),
            ("incident_outcome", json!("1")),
        ]);
        let doc = CaseRecord::from_row(&source, 2024, None, "cases:row 2")
            .unwrap()
            .into_document();
        assert_eq!(doc.logical_key, "case:77:2024");
        assert_eq!(doc.content_hash, compute_content_hash(&Value::Object(source.clone())));
        assert_eq!(doc.record.case_number.as_deref(), Some("2024-009"));

        let summary = SummaryRecord::from_row(&source, 2024, None, "summary:row 2")
            .unwrap()
            .into_document();
        assert_eq!(summary.logical_key, "300a:77:2024");
        assert_eq!(summary.content_hash, doc.content_hash);
    }

    #[test]
    fn test_summary_key_falls_back_to_establishment() {
        let record = SummaryRecord::from_row(
            &row(&[("establishment_id", json!(77)), ("total_deaths", json!(0))]),
            2023,
            None,
            "summary:row 3",
        )
        .unwrap();
        assert_eq!(record.logical_key(), "300a:est-77:2023");
    }

    #[test]
    fn test_row_without_identity_is_rejected() {
        let err = SummaryRecord::from_row(&row(&[("total_deaths", json!(0))]), 2023, None, "summary:row 9")
            .unwrap_err();
        assert!(matches!(err, IngestError::Record { ref key, .. } if key == "summary:row 9"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_case_record() {
        let record = CaseRecord::from_row(
            &row(&[
                ("establishment_id", json!(77)),
                ("case_number", json!("2024-003")),
                ("date_of_incident", json!(45121)),
                ("time_of_incident", json!("14:30")),
                ("time_unknown", json!("N")),
                ("incident_outcome", json!("3")),
                ("new_incident_description", json!("Fell from ladder")),
            ]),
            2024,
            None,
            "cases:row 2",
        )
        .unwrap();

        assert_eq!(record.logical_key(), "case:est-77:2024-003:2024");
        assert_eq!(record.date_of_incident, NaiveDate::from_ymd_opt(2023, 7, 14));
        assert_eq!(record.time_of_incident, NaiveTime::from_hms_opt(14, 30, 0));
        assert!(!record.time_unknown);
        assert_eq!(record.incident_outcome, Some(3));
        assert_eq!(record.narratives()["description"], "Fell from ladder");
    }

    #[test]
    fn test_case_needs_id_or_number() {
        let err = CaseRecord::from_row(&row(&[("establishment_id", json!(77))]), 2024, None, "cases:row 4");
        assert!(err.is_err());
    }

    #[test]
    fn test_snapshot_shape() {
        let est = Establishment::from_row(&row(&[
            ("establishment_name", json!("Acme Roofing")),
            ("city", json!("Austin")),
            ("naics_code", json!(238160)),
        ]));
        let snapshot = est.snapshot(2024);
        assert_eq!(snapshot["address"]["city"], "Austin");
        assert_eq!(snapshot["naics"]["code"], "238160");
        assert_eq!(snapshot["naics"]["year"], DEFAULT_NAICS_YEAR);
        assert_eq!(snapshot["filing_year"], 2024);
    }
}
