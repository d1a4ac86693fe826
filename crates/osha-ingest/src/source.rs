//! Source file readers
//!
//! JSON documents are read whole. Tabular sources (CSV, Excel) become
//! [`Sheet`]s of rows keyed by normalized column name, with blank cells
//! mapped to `null` and fully blank rows dropped.

use calamine::{open_workbook_auto, Data, Reader};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::coerce::normalize_column_name;
use crate::error::{IngestError, Result};

pub type Row = Map<String, Value>;

/// File name fragments marking companion files that hold no data
const SKIPPED_NAME_FRAGMENTS: [&str; 3] = ["dictionary", "readme", "documentation"];

pub const TABULAR_EXTENSIONS: [&str; 5] = ["csv", "xlsx", "xlsm", "xlsb", "xls"];

pub const JSON_EXTENSIONS: [&str; 1] = ["json"];

#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

fn structural(path: &Path, err: impl std::fmt::Display) -> IngestError {
    IngestError::structural(path.display().to_string(), err.to_string())
}

pub fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|e| structural(path, e))?;
    serde_json::from_str(&text).map_err(|e| structural(path, format!("invalid JSON: {e}")))
}

/// Normalize header cells, suffixing repeats (`name`, `name_2`, ...)
fn header_names<'a>(raw: impl Iterator<Item = String> + 'a) -> Vec<String> {
    let mut taken = HashSet::new();
    let mut columns = Vec::new();
    for (i, name) in raw.enumerate() {
        let normalized = normalize_column_name(&name);
        let base = if normalized.is_empty() {
            format!("column_{}", i + 1)
        } else {
            normalized
        };

        let mut column = base.clone();
        let mut n = 2;
        while !taken.insert(column.clone()) {
            column = format!("{base}_{n}");
            n += 1;
        }
        if column != base {
            warn!(header = %name, column = %column, "Duplicate column name after normalization, renamed");
        }
        columns.push(column);
    }
    columns
}

fn text_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Value::Null
    } else {
        Value::String(trimmed.to_string())
    }
}

fn push_row(rows: &mut Vec<Row>, row: Row) {
    if row.values().any(|v| !v.is_null()) {
        rows.push(row);
    }
}

/// Read a CSV file with a header row
///
/// Cells are decoded lossily so one badly encoded row cannot sink the file.
pub fn read_csv(path: &Path) -> Result<Sheet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| structural(path, e))?;

    let columns = header_names(
        reader
            .byte_headers()
            .map_err(|e| structural(path, e))?
            .iter()
            .map(|h| String::from_utf8_lossy(h).into_owned()),
    );
    if columns.is_empty() {
        return Err(structural(path, "missing header row"));
    }

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record.map_err(|e| structural(path, e))?;
        let row: Row = columns
            .iter()
            .zip(record.iter())
            .map(|(col, cell)| (col.clone(), text_cell(&String::from_utf8_lossy(cell))))
            .collect();
        push_row(&mut rows, row);
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!(file = %path.display(), rows = rows.len(), "CSV read");
    Ok(Sheet {
        name,
        columns,
        rows,
    })
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Data::String(s) => text_cell(s),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => Number::from_f64(dt.as_f64())
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::DateTimeIso(s) | Data::DurationIso(s) => text_cell(s),
        Data::Error(_) | Data::Empty => Value::Null,
    }
}

/// Read every non-empty worksheet of an Excel workbook
///
/// Date cells are kept as serial day numbers; the field mapper converts them.
pub fn read_workbook(path: &Path) -> Result<Vec<Sheet>> {
    let mut workbook = open_workbook_auto(path).map_err(|e| structural(path, e))?;
    let mut sheets = Vec::new();

    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| structural(path, format!("sheet '{name}': {e}")))?;
        let mut grid = range.rows();
        let Some(header) = grid.next() else {
            debug!(sheet = %name, "Empty worksheet skipped");
            continue;
        };

        let columns = header_names(header.iter().map(|c| c.to_string()));
        let mut rows = Vec::new();
        for cells in grid {
            let row: Row = columns
                .iter()
                .zip(cells.iter())
                .map(|(col, cell)| (col.clone(), cell_value(cell)))
                .collect();
            push_row(&mut rows, row);
        }

        debug!(sheet = %name, rows = rows.len(), "Worksheet read");
        sheets.push(Sheet {
            name,
            columns,
            rows,
        });
    }

    Ok(sheets)
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Read a CSV or Excel file into sheets
pub fn read_tabular(path: &Path) -> Result<Vec<Sheet>> {
    match extension(path).as_str() {
        "csv" => Ok(vec![read_csv(path)?]),
        ext if TABULAR_EXTENSIONS.contains(&ext) => read_workbook(path),
        other => Err(structural(path, format!("unsupported file type '.{other}'"))),
    }
}

/// Data dictionaries, readmes and similar companions are never loaded
pub fn is_companion_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    SKIPPED_NAME_FRAGMENTS.iter().any(|frag| name.contains(frag))
}

/// Resolve an input path to the list of files to load, sorted by path
///
/// A file is returned as-is; a directory is walked (recursively unless
/// `recursive` is false) for files with one of `extensions`.
pub fn collect_source_files(root: &Path, recursive: bool, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        return Err(structural(root, "path does not exist"));
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    for entry in WalkDir::new(root).max_depth(max_depth).sort_by_file_name() {
        let entry = entry.map_err(|e| structural(root, e))?;
        let path = entry.path();
        if !entry.file_type().is_file() || !extensions.contains(&extension(path).as_str()) {
            continue;
        }
        if is_companion_file(path) {
            info!(file = %path.display(), "Skipping documentation file");
            continue;
        }
        files.push(path.to_path_buf());
    }

    if files.is_empty() {
        return Err(structural(root, "no loadable files found"));
    }
    Ok(files)
}
