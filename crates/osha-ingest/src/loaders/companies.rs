//! Companies workbook loader
//!
//! A companies workbook holds a `Companies_Details` sheet (one row per
//! company with its industry, sector and region) and a
//! `Companies_to_Regulations` sheet linking company names to the regulation
//! parts they follow. Sheets are recognised by their columns, so the two may
//! also arrive as separate CSV files.
//!
//! Every company becomes one versioned row in `companies` with its regulation
//! links as child rows. Industries, sectors, regions, regulatory bodies and
//! regulation parts are shared reference rows, upserted inside the company's
//! transaction and never truncated.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn, Instrument};

use super::{load_parsed, LoadContext, LoaderRun, Parsed};
use crate::coerce::{coerce_i32, coerce_int, coerce_string};
use crate::error::{IngestError, Result};
use crate::framework::{Document, PgVersionStore, RecordMapper, VersionedLoader};
use crate::source::{collect_source_files, read_tabular, Row, Sheet, TABULAR_EXTENSIONS};

pub const LOAD_TYPE: &str = "companies";

const DETAILS_COLUMNS: [&str; 2] = ["companyid", "companyname"];

const REGULATION_COLUMNS: [&str; 2] = ["company_name", "regulations_parts"];

/// Longest regulation part name kept whole
pub const MAX_REGULATION_NAME: usize = 500;

pub const DEFAULT_COMPLIANCE_STATUS: &str = "Under Review";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanySheet {
    Details,
    Regulations,
}

impl CompanySheet {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanySheet::Details => "company details",
            CompanySheet::Regulations => "company regulations",
        }
    }
}

pub fn classify(columns: &[String]) -> Option<CompanySheet> {
    let has_all = |wanted: &[&str]| wanted.iter().all(|w| columns.iter().any(|c| c == w));
    if has_all(&DETAILS_COLUMNS) {
        Some(CompanySheet::Details)
    } else if has_all(&REGULATION_COLUMNS) {
        Some(CompanySheet::Regulations)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RegulatoryLevel {
    Federal,
    State,
    Local,
    International,
}

impl RegulatoryLevel {
    /// Free-text level from the workbook; unknown or blank means federal
    pub fn from_raw(raw: Option<&str>) -> Self {
        let lowered = raw.unwrap_or_default().trim().to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
        if has(&["federal"]) {
            RegulatoryLevel::Federal
        } else if has(&["state", "provincial"]) {
            RegulatoryLevel::State
        } else if has(&["local", "municipal", "county"]) {
            RegulatoryLevel::Local
        } else if has(&["international", "global"]) {
            RegulatoryLevel::International
        } else {
            RegulatoryLevel::Federal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegulatoryLevel::Federal => "Federal",
            RegulatoryLevel::State => "State",
            RegulatoryLevel::Local => "Local",
            RegulatoryLevel::International => "International",
        }
    }
}

/// Trimmed, with line breaks and runs of whitespace folded to one space
pub fn clean_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// [`clean_name`], cut to [`MAX_REGULATION_NAME`] characters with an ellipsis
pub fn clean_regulation_name(raw: &str) -> String {
    let cleaned = clean_name(raw);
    if cleaned.chars().count() <= MAX_REGULATION_NAME {
        return cleaned;
    }
    let mut cut: String = cleaned.chars().take(MAX_REGULATION_NAME - 3).collect();
    cut.push_str("...");
    cut
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub id: i32,
    pub name: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct RegulationLink {
    pub regulation: String,
    pub body: Option<String>,
    pub level: RegulatoryLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyRecord {
    pub company_id: i64,
    pub company_name: String,
    pub zipcode: Option<String>,
    pub industry: Option<Classification>,
    pub sector: Option<Classification>,
    pub region: Option<Region>,
    /// Sorted so the content hash does not depend on mapping row order
    pub regulations: BTreeSet<RegulationLink>,
}

impl CompanyRecord {
    pub fn logical_key(&self) -> String {
        format!("company:{}", self.company_id)
    }
}

/// The first id seen for a name is the one every company points at
struct Canonical<K> {
    ids: HashMap<K, i32>,
}

impl<K: Hash + Eq> Canonical<K> {
    fn new() -> Self {
        Self { ids: HashMap::new() }
    }

    fn resolve(&mut self, key: K, id: i32) -> i32 {
        *self.ids.entry(key).or_insert(id)
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    coerce_string(row.get(column))
}

fn row_label(sheet: &Sheet, index: usize) -> String {
    format!("{}:row {}", sheet.name, index + 2)
}

struct Classifier {
    industries: Canonical<String>,
    sectors: Canonical<String>,
    regions: Canonical<(String, String)>,
}

impl Classifier {
    fn company(&mut self, row: &Row, label: &str) -> Result<CompanyRecord> {
        let company_id = coerce_int(row.get("companyid"));
        let company_name = text(row, "companyname")
            .map(|n| clean_name(&n))
            .filter(|n| !n.is_empty());
        let (Some(company_id), Some(company_name)) = (company_id, company_name) else {
            return Err(IngestError::record(label, "company row needs companyid and companyname"));
        };

        let industry = match (coerce_i32(row.get("industryid")), text(row, "industryname")) {
            (Some(id), Some(name)) => Some(Classification {
                id: self.industries.resolve(name.clone(), id),
                name,
            }),
            _ => None,
        };
        let sector = match (coerce_i32(row.get("sectorid")), text(row, "sectorname")) {
            (Some(id), Some(name)) => Some(Classification {
                id: self.sectors.resolve(name.clone(), id),
                name,
            }),
            _ => None,
        };
        let region = match (
            coerce_i32(row.get("regionid")),
            text(row, "region_name"),
            text(row, "country_name"),
        ) {
            (Some(id), Some(name), Some(country)) => Some(Region {
                id: self.regions.resolve((name.clone(), country.clone()), id),
                name,
                country,
            }),
            _ => None,
        };

        Ok(CompanyRecord {
            company_id,
            company_name,
            zipcode: text(row, "zipcode"),
            industry,
            sector,
            region,
            regulations: BTreeSet::new(),
        })
    }
}

fn regulation_link(row: &Row, label: &str) -> Result<(String, RegulationLink)> {
    let company = text(row, "company_name").map(|n| clean_name(&n)).unwrap_or_default();
    let regulation = text(row, "regulations_parts")
        .map(|n| clean_regulation_name(&n))
        .unwrap_or_default();
    if company.is_empty() || regulation.is_empty() {
        return Err(IngestError::record(label, "mapping row needs company_name and regulations_parts"));
    }
    let body = text(row, "regulatory_body")
        .map(|n| clean_name(&n))
        .filter(|n| !n.is_empty());
    let level = RegulatoryLevel::from_raw(text(row, "level").as_deref());
    Ok((company, RegulationLink { regulation, body, level }))
}

enum Slot {
    Company(CompanyRecord),
    Rejected { key: String, error: IngestError },
}

/// Turn classified sheets into company documents
///
/// Returns one list per input sheet, in input order. Details sheets yield
/// their companies (with every regulation linked to them by name) and
/// rejected rows; regulation sheets yield only their rejected rows. A
/// mapping row naming a company that several rows share links all of them.
pub fn parse(sheets: &[(CompanySheet, Sheet)], origin: &str) -> Result<Vec<Vec<Parsed<CompanyRecord>>>> {
    if !sheets.iter().any(|(kind, _)| *kind == CompanySheet::Details) {
        return Err(IngestError::structural(origin, "no Companies_Details sheet found"));
    }

    let mut classifier = Classifier {
        industries: Canonical::new(),
        sectors: Canonical::new(),
        regions: Canonical::new(),
    };
    let mut slots: Vec<Vec<Slot>> = Vec::with_capacity(sheets.len());
    let mut by_name: HashMap<String, Vec<(usize, usize)>> = HashMap::new();

    for (sheet_index, (kind, sheet)) in sheets.iter().enumerate() {
        let mut sheet_slots = Vec::new();
        if *kind == CompanySheet::Details {
            for (index, row) in sheet.rows.iter().enumerate() {
                let label = row_label(sheet, index);
                match classifier.company(row, &label) {
                    Ok(company) => {
                        by_name
                            .entry(company.company_name.clone())
                            .or_default()
                            .push((sheet_index, sheet_slots.len()));
                        sheet_slots.push(Slot::Company(company));
                    },
                    Err(error) => sheet_slots.push(Slot::Rejected { key: label, error }),
                }
            }
        }
        slots.push(sheet_slots);
    }

    for (sheet_index, (kind, sheet)) in sheets.iter().enumerate() {
        if *kind != CompanySheet::Regulations {
            continue;
        }
        for (index, row) in sheet.rows.iter().enumerate() {
            let label = row_label(sheet, index);
            let rejection = match regulation_link(row, &label) {
                Ok((company, link)) => match by_name.get(&company) {
                    Some(targets) => {
                        for &(target_sheet, target_slot) in targets {
                            if let Slot::Company(record) = &mut slots[target_sheet][target_slot] {
                                record.regulations.insert(link.clone());
                            }
                        }
                        None
                    },
                    None => Some(IngestError::record(
                        &label,
                        format!("no company named '{company}' in the details sheet"),
                    )),
                },
                Err(error) => Some(error),
            };
            if let Some(error) = rejection {
                slots[sheet_index].push(Slot::Rejected { key: label, error });
            }
        }
    }

    Ok(slots
        .into_iter()
        .map(|sheet_slots| sheet_slots.into_iter().map(into_parsed).collect())
        .collect())
}

fn into_parsed(slot: Slot) -> Parsed<CompanyRecord> {
    match slot {
        Slot::Company(record) => {
            let key = record.logical_key();
            match serde_json::to_value(&record) {
                Ok(raw) => Parsed::Ready(Document::new(key, &raw, record)),
                Err(err) => Parsed::Rejected {
                    error: IngestError::record(&key, err.to_string()),
                    key,
                },
            }
        },
        Slot::Rejected { key, error } => Parsed::Rejected { key, error },
    }
}

async fn industry_id(conn: &mut PgConnection, industry: &Classification) -> Result<i32> {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO industries (industry_id, industry_name) VALUES ($1, $2) \
         ON CONFLICT (industry_name) DO UPDATE SET industry_name = EXCLUDED.industry_name \
         RETURNING industry_id",
    )
    .bind(industry.id)
    .bind(&industry.name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn sector_id(conn: &mut PgConnection, sector: &Classification) -> Result<i32> {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO sectors (sector_id, sector_name) VALUES ($1, $2) \
         ON CONFLICT (sector_name) DO UPDATE SET sector_name = EXCLUDED.sector_name \
         RETURNING sector_id",
    )
    .bind(sector.id)
    .bind(&sector.name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn region_id(conn: &mut PgConnection, region: &Region) -> Result<i32> {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO regions (region_id, region_name, country_name) VALUES ($1, $2, $3) \
         ON CONFLICT (region_name, country_name) DO UPDATE SET region_name = EXCLUDED.region_name \
         RETURNING region_id",
    )
    .bind(region.id)
    .bind(&region.name)
    .bind(&region.country)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Get or create the regulatory body and regulation part of a link
///
/// A body keeps the level it was first created with.
async fn regulation_part_id(conn: &mut PgConnection, link: &RegulationLink) -> Result<i64> {
    let body_id = match &link.body {
        Some(body) => {
            let (id,): (i64,) = sqlx::query_as(
                "INSERT INTO regulatory_bodies (regulatory_body_name, regulatory_level) VALUES ($1, $2) \
                 ON CONFLICT (regulatory_body_name) DO UPDATE SET regulatory_body_name = EXCLUDED.regulatory_body_name \
                 RETURNING regulatory_body_id",
            )
            .bind(body)
            .bind(link.level.as_str())
            .fetch_one(&mut *conn)
            .await?;
            Some(id)
        },
        None => None,
    };

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO regulation_parts (regulation_name, regulatory_body_id) VALUES ($1, $2) \
         ON CONFLICT (regulation_name) DO UPDATE SET \
             regulatory_body_id = COALESCE(regulation_parts.regulatory_body_id, EXCLUDED.regulatory_body_id) \
         RETURNING regulation_part_id",
    )
    .bind(&link.regulation)
    .bind(body_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Canonical reference ids of one company
struct References {
    industry_id: Option<i32>,
    sector_id: Option<i32>,
    region_id: Option<i32>,
}

async fn upsert_references(conn: &mut PgConnection, record: &CompanyRecord) -> Result<References> {
    let industry_id = match &record.industry {
        Some(industry) => Some(industry_id(conn, industry).await?),
        None => None,
    };
    let sector_id = match &record.sector {
        Some(sector) => Some(sector_id(conn, sector).await?),
        None => None,
    };
    let region_id = match &record.region {
        Some(region) => Some(region_id(conn, region).await?),
        None => None,
    };
    Ok(References {
        industry_id,
        sector_id,
        region_id,
    })
}

pub struct CompanyMapper {
    created_by: String,
}

impl CompanyMapper {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
        }
    }
}

#[async_trait]
impl RecordMapper for CompanyMapper {
    type Record = CompanyRecord;

    fn table(&self) -> &'static str {
        "companies"
    }

    async fn insert_version(&self, conn: &mut PgConnection, doc: &Document<CompanyRecord>) -> Result<i64> {
        let record = &doc.record;
        let refs = upsert_references(conn, record).await?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO companies (
                logical_key, content_hash, is_current, company_id, company_name, zipcode,
                industry_id, sector_id, region_id, created_by
            ) VALUES ($1, $2, TRUE, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&doc.logical_key)
        .bind(&doc.content_hash)
        .bind(record.company_id)
        .bind(&record.company_name)
        .bind(&record.zipcode)
        .bind(refs.industry_id)
        .bind(refs.sector_id)
        .bind(refs.region_id)
        .bind(&self.created_by)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn update_version(&self, conn: &mut PgConnection, id: i64, doc: &Document<CompanyRecord>) -> Result<()> {
        let record = &doc.record;
        let refs = upsert_references(conn, record).await?;
        let result = sqlx::query(
            r#"
            UPDATE companies SET
                content_hash = $2, is_current = TRUE, company_name = $3, zipcode = $4,
                industry_id = $5, sector_id = $6, region_id = $7, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&doc.content_hash)
        .bind(&record.company_name)
        .bind(&record.zipcode)
        .bind(refs.industry_id)
        .bind(refs.sector_id)
        .bind(refs.region_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::record(&doc.logical_key, format!("company row {id} no longer exists")));
        }
        Ok(())
    }

    async fn write_children(&self, conn: &mut PgConnection, id: i64, doc: &Document<CompanyRecord>) -> Result<u64> {
        let mut written = 0;
        for link in &doc.record.regulations {
            let part_id = regulation_part_id(conn, link).await?;
            written += sqlx::query(
                "INSERT INTO company_regulations (company_row_id, regulation_part_id, compliance_status) \
                 VALUES ($1, $2, $3) ON CONFLICT (company_row_id, regulation_part_id) DO NOTHING",
            )
            .bind(id)
            .bind(part_id)
            .bind(DEFAULT_COMPLIANCE_STATUS)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        }
        Ok(written)
    }

    async fn delete_children(&self, conn: &mut PgConnection, id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM company_regulations WHERE company_row_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Reference and company row counts after the load, reported as notes
pub async fn integrity_check(pool: &PgPool) -> Result<Vec<String>> {
    let counts: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM industries),
            (SELECT COUNT(*) FROM sectors),
            (SELECT COUNT(*) FROM regions),
            (SELECT COUNT(*) FROM regulatory_bodies),
            (SELECT COUNT(*) FROM regulation_parts),
            (SELECT COUNT(*) FROM companies WHERE is_current),
            (SELECT COUNT(*) FROM company_regulations cr
                JOIN companies c ON c.id = cr.company_row_id WHERE c.is_current)
        "#,
    )
    .fetch_one(pool)
    .await?;

    let (industries, sectors, regions, bodies, parts, companies, links) = counts;
    Ok(vec![
        format!("industries: {industries}"),
        format!("sectors: {sectors}"),
        format!("regions: {regions}"),
        format!("regulatory bodies: {bodies}"),
        format!("regulation parts: {parts}"),
        format!("current companies: {companies}"),
        format!("company regulation links: {links}"),
    ])
}

pub async fn run(ctx: &mut LoadContext, path: &Path) -> Result<LoaderRun> {
    let mut run = LoaderRun::default();

    let mut files: Vec<(PathBuf, Vec<usize>)> = Vec::new();
    let mut sheets = Vec::new();
    for file in collect_source_files(path, true, &TABULAR_EXTENSIONS)? {
        let mut indices = Vec::new();
        for sheet in read_tabular(&file)? {
            match classify(&sheet.columns) {
                Some(kind) => {
                    info!(file = %file.display(), sheet = %sheet.name, kind = kind.as_str(), rows = sheet.rows.len(), "Sheet recognized");
                    indices.push(sheets.len());
                    sheets.push((kind, sheet));
                },
                None => {
                    warn!(file = %file.display(), sheet = %sheet.name, "Unrecognized sheet, skipping");
                    run.notes.push(format!("skipped unrecognized sheet '{}' in {}", sheet.name, file.display()));
                },
            }
        }
        files.push((file, indices));
    }

    let mut parsed = parse(&sheets, &path.display().to_string())?;
    info!(files = files.len(), sheets = sheets.len(), "Companies input validated");

    let mapper = CompanyMapper::new(&ctx.created_by);
    let mut loader = VersionedLoader::new(PgVersionStore::new(ctx.pool.clone(), mapper), ctx.options);
    loader.prepare().await?;

    for (file, indices) in files {
        let audit = ctx.start_file(&file, LOAD_TYPE, None).await?;
        let span = info_span!("load", load_type = LOAD_TYPE, file = %audit.source_file_name, load_id = %audit.load_id);
        let documents: Vec<Parsed<CompanyRecord>> = indices
            .iter()
            .flat_map(|&i| std::mem::take(&mut parsed[i]))
            .collect();

        let outcome = async {
            for document in documents {
                load_parsed(&mut loader, document).await?;
            }
            Ok::<_, IngestError>(())
        }
        .instrument(span)
        .await;

        let stats = vec![loader.finish_file()];
        run.files.push(ctx.finish_file(&audit, &file, outcome, stats).await?);
    }

    run.tables.push(loader.into_stats());
    if ctx.options.persists() {
        run.notes.extend(integrity_check(&ctx.pool).await?);
    }
    Ok(run)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sheet(name: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Sheet {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|cells| columns.iter().cloned().zip(cells).collect::<Row>())
            .collect();
        Sheet {
            name: name.to_string(),
            columns,
            rows,
        }
    }

    fn details() -> Sheet {
        sheet(
            "Companies_Details",
            &[
                "companyid", "companyname", "zipcode", "industryid", "industryname", "sectorid",
                "sectorname", "regionid", "region_name", "country_name",
            ],
            vec![
                vec![json!(101.0), json!(" Acme\r\nRoofing "), json!("78701"), json!(7), json!("Construction"),
                     json!(3), json!("Private"), json!(40), json!("South"), json!("USA")],
                vec![json!(102), json!("Beta Steel"), Value::Null, json!(9), json!("Construction"),
                     json!(3), json!("Private"), json!(41), json!("South"), json!("USA")],
                vec![json!(103), Value::Null, Value::Null, Value::Null, Value::Null,
                     Value::Null, Value::Null, Value::Null, Value::Null, Value::Null],
            ],
        )
    }

    fn mappings() -> Sheet {
        sheet(
            "Companies_to_Regulations",
            &["company_name", "regulations_parts", "regulatory_body", "level"],
            vec![
                vec![json!("Acme Roofing"), json!("29 CFR 1926 Subpart M"), json!("OSHA"), json!("federal agency")],
                vec![json!("Acme  Roofing"), json!("29 CFR 1904"), json!("OSHA"), json!("Federal")],
                vec![json!("Beta Steel"), json!("Texas Labor Code"), json!("Texas Workforce Commission"), json!("State")],
                vec![json!("Gamma Cranes"), json!("29 CFR 1926 Subpart CC"), json!("OSHA"), json!("Federal")],
                vec![json!("Beta Steel"), Value::Null, json!("OSHA"), json!("Federal")],
            ],
        )
    }

    fn ready(parsed: &[Parsed<CompanyRecord>]) -> Vec<&Document<CompanyRecord>> {
        parsed
            .iter()
            .filter_map(|p| match p {
                Parsed::Ready(doc) => Some(doc),
                Parsed::Rejected { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_classify_by_columns() {
        assert_eq!(classify(&details().columns), Some(CompanySheet::Details));
        assert_eq!(classify(&mappings().columns), Some(CompanySheet::Regulations));
        assert_eq!(classify(&["companyid".to_string()]), None);
    }

    #[test]
    fn test_regulatory_level_cleaning() {
        assert_eq!(RegulatoryLevel::from_raw(Some(" FEDERAL agency")), RegulatoryLevel::Federal);
        assert_eq!(RegulatoryLevel::from_raw(Some("Provincial")), RegulatoryLevel::State);
        assert_eq!(RegulatoryLevel::from_raw(Some("county board")), RegulatoryLevel::Local);
        assert_eq!(RegulatoryLevel::from_raw(Some("Global")), RegulatoryLevel::International);
        assert_eq!(RegulatoryLevel::from_raw(Some("tribal")), RegulatoryLevel::Federal);
        assert_eq!(RegulatoryLevel::from_raw(None), RegulatoryLevel::Federal);
    }

    #[test]
    fn test_name_cleaning() {
        assert_eq!(clean_name("  O'Neil\r\n  Builders\tLLC "), "O'Neil Builders LLC");

        let long = "x".repeat(MAX_REGULATION_NAME + 20);
        let cleaned = clean_regulation_name(&long);
        assert_eq!(cleaned.chars().count(), MAX_REGULATION_NAME);
        assert!(cleaned.ends_with("..."));
        assert_eq!(clean_regulation_name("29 CFR  1904"), "29 CFR 1904");
    }

    #[test]
    fn test_companies_get_canonical_ids_and_links() {
        let sheets = vec![(CompanySheet::Details, details()), (CompanySheet::Regulations, mappings())];
        let parsed = parse(&sheets, "companies.xlsx").unwrap();
        assert_eq!(parsed.len(), 2);

        let companies = ready(&parsed[0]);
        assert_eq!(companies.len(), 2);
        let acme = &companies[0].record;
        assert_eq!(companies[0].logical_key, "company:101");
        assert_eq!(acme.company_name, "Acme Roofing");
        assert_eq!(acme.regulations.len(), 2);
        assert!(acme.regulations.iter().all(|l| l.level == RegulatoryLevel::Federal));

        // same names under other ids resolve to the first id seen
        let beta = &companies[1].record;
        assert_eq!(beta.industry.as_ref().unwrap().id, 7);
        assert_eq!(beta.region.as_ref().unwrap().id, 40);
        assert_eq!(beta.zipcode, None);
        assert_eq!(beta.regulations.iter().next().unwrap().level, RegulatoryLevel::State);

        // the nameless company row
        assert!(matches!(&parsed[0][2], Parsed::Rejected { key, .. } if key == "Companies_Details:row 4"));

        // unknown company and missing regulation
        let rejected: Vec<&str> = parsed[1].iter().map(Parsed::key).collect();
        assert_eq!(rejected, ["Companies_to_Regulations:row 5", "Companies_to_Regulations:row 6"]);
    }

    #[test]
    fn test_hash_ignores_mapping_row_order() {
        let mut reversed = mappings();
        reversed.rows.reverse();
        let hash = |m: Sheet| {
            let parsed = parse(&[(CompanySheet::Details, details()), (CompanySheet::Regulations, m)], "c").unwrap();
            ready(&parsed[0])[0].content_hash.clone()
        };
        assert_eq!(hash(mappings()), hash(reversed));
    }

    #[test]
    fn test_details_sheet_is_required() {
        let err = parse(&[(CompanySheet::Regulations, mappings())], "companies.xlsx").unwrap_err();
        assert!(err.is_fatal());
    }
}
