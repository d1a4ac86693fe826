//! Input parsing tests against the bundled fixtures (no database needed)

use osha_ingest::framework::compute_content_hash;
use osha_ingest::loaders::ita::{classify, CaseRecord, SheetKind, SummaryRecord};
use osha_ingest::loaders::companies::{self, CompanySheet};
use osha_ingest::loaders::{cfr_1904, cfr_content, recordkeeping, regulation, Parsed};
use osha_ingest::source::{collect_source_files, read_json, read_tabular, JSON_EXTENSIONS, TABULAR_EXTENSIONS};

mod common;
use common::{fixture, fixtures};

fn ready<T>(parsed: &[Parsed<T>]) -> Vec<&osha_ingest::framework::Document<T>> {
    parsed
        .iter()
        .filter_map(|p| match p {
            Parsed::Ready(doc) => Some(doc),
            Parsed::Rejected { .. } => None,
        })
        .collect()
}

// ============================================================================
// JSON loaders
// ============================================================================

#[test]
fn test_regulation_fixture() {
    let path = fixture("regulation/subpart_m.json");
    let docs = regulation::parse(read_json(&path).unwrap(), "subpart_m.json").unwrap();
    let docs = ready(&docs);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].logical_key, "29-CFR-1926-Subpart-M");

    let rule = &docs[0].record.sections[1].subsections[0].rules[0];
    let conditions = regulation::condition_rows(rule);
    assert_eq!(conditions.len(), 2);
}

#[test]
fn test_regulation_hash_is_stable_across_reads() {
    let path = fixture("regulation/subpart_m.json");
    let first = regulation::parse(read_json(&path).unwrap(), "a").unwrap();
    let second = regulation::parse(read_json(&path).unwrap(), "b").unwrap();
    assert_eq!(ready(&first)[0].content_hash, ready(&second)[0].content_hash);
}

#[test]
fn test_cfr_content_fixture() {
    let path = fixture("cfr_content/subpart_z.json");
    let raw = read_json(&path).unwrap();
    let docs = cfr_content::parse(raw.clone(), "subpart_z.json").unwrap();
    let docs = ready(&docs);
    let keys: Vec<_> = docs.iter().map(|d| d.logical_key.as_str()).collect();
    assert_eq!(
        keys,
        [
            "29 CFR 1910 Subpart Z:1910.1200(c)",
            "29 CFR 1910 Subpart Z:1910.1200(h)",
            "29 CFR 1910 Subpart Z:1910.1200(p)",
        ]
    );
    // each item is versioned on its own content
    assert_eq!(docs[0].content_hash, compute_content_hash(&raw["extracted_content"][0]));
}

#[test]
fn test_recordkeeping_fixture() {
    let path = fixture("recordkeeping/cfr_1904.json");
    let docs = recordkeeping::parse(read_json(&path).unwrap(), "cfr_1904.json").unwrap();
    let docs = ready(&docs);
    assert_eq!(docs[0].logical_key, "29_CFR_1904:v1.0");
    let counts = docs[0].record.counts;
    assert_eq!(counts.naics_codes, 4);
    assert_eq!(counts.decision_tree_steps, 3);
    assert_eq!(counts.required_forms, 3);
    assert_eq!(counts.definitions, 3);
}

#[test]
fn test_cfr_1904_fixture_spreads_over_sections() {
    let path = fixture("recordkeeping/cfr_1904.json");
    let relational = cfr_1904::parse(read_json(&path).unwrap(), "cfr_1904.json").unwrap();
    let version = &ready(&relational)[0];
    assert_eq!(version.logical_key, "29_CFR_1904:v1.0");

    let record = &version.record;
    assert_eq!(record.authorities.len(), 4);
    assert_eq!(record.naics_codes.len(), 7);
    assert_eq!(record.size_exemptions[0].employee_threshold, 10);
    assert_eq!(record.first_aid.len(), 3);
    assert_eq!(record.child_rows(), 48);

    // both recordkeeping loaders version the same document identically
    let document = recordkeeping::parse(read_json(&path).unwrap(), "cfr_1904.json").unwrap();
    assert_eq!(ready(&document)[0].content_hash, version.content_hash);
}

#[test]
fn test_json_fixtures_are_discovered_recursively() {
    let files = collect_source_files(&fixtures(), true, &JSON_EXTENSIONS).unwrap();
    assert_eq!(files.len(), 3);
    assert!(collect_source_files(&fixtures(), false, &JSON_EXTENSIONS).is_err());
}

// ============================================================================
// ITA extracts
// ============================================================================

#[test]
fn test_ita_sheets_are_classified() {
    let files = collect_source_files(&fixture("ita"), true, &TABULAR_EXTENSIONS).unwrap();
    assert_eq!(files.len(), 2);

    let kinds: Vec<_> = files
        .iter()
        .flat_map(|f| read_tabular(f).unwrap())
        .map(|sheet| classify(&sheet.columns))
        .collect();
    assert_eq!(kinds, [Some(SheetKind::Summary300A), Some(SheetKind::CaseDetail)]);
}

#[test]
fn test_ita_summary_rows() {
    let sheets = read_tabular(&fixture("ita/2023/ITA_300A_Summary_Data_2023.csv")).unwrap();
    let rows = &sheets[0].rows;
    assert_eq!(rows.len(), 3);

    let acme = SummaryRecord::from_row(&rows[0], 2023, None, "row 2").unwrap();
    assert_eq!(acme.logical_key(), "300a:9001:2023");
    assert_eq!(acme.annual_average_employees, Some(42));
    assert_eq!(acme.filing.establishment.state_code.as_deref(), Some("TX"));

    // the third row has no establishment identity at all
    assert!(SummaryRecord::from_row(&rows[2], 2023, None, "row 4").is_err());
}

#[test]
fn test_ita_case_rows() {
    let sheets = read_tabular(&fixture("ita/2023/ITA_Case_Detail_Data_2023.csv")).unwrap();
    let records: Vec<_> = sheets[0]
        .rows
        .iter()
        .map(|row| CaseRecord::from_row(row, 2023, None, "row").unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].logical_key(), "case:71001:2023");
    assert!(!records[0].time_unknown);
    assert!(records[1].time_unknown);
    assert!(records[1].time_of_incident.is_none());
}

// ============================================================================
// Companies workbook
// ============================================================================

fn company_sheets() -> Vec<(CompanySheet, osha_ingest::source::Sheet)> {
    collect_source_files(&fixture("companies"), true, &TABULAR_EXTENSIONS)
        .unwrap()
        .iter()
        .flat_map(|f| read_tabular(f).unwrap())
        .map(|sheet| (companies::classify(&sheet.columns).unwrap(), sheet))
        .collect()
}

#[test]
fn test_company_fixture_sheets() {
    let sheets = company_sheets();
    let kinds: Vec<_> = sheets.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, [CompanySheet::Details, CompanySheet::Regulations]);

    let parsed = companies::parse(&sheets, "companies").unwrap();
    let details = ready(&parsed[0]);
    let names: Vec<_> = details.iter().map(|d| d.record.company_name.as_str()).collect();
    assert_eq!(names, ["Acme Roofing", "Beta Steel", "Gamma Cranes"]);
    assert_eq!(details[0].record.regulations.len(), 2);
    assert_eq!(details[1].record.industry.as_ref().unwrap().id, 7);

    // the nameless company and the mapping for an unknown company
    assert_eq!(parsed[0].len(), 4);
    let unmatched: Vec<_> = parsed[1].iter().map(Parsed::key).collect();
    assert_eq!(unmatched, ["Companies_to_Regulations:row 7"]);
}
