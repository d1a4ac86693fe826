//! Field mapping helpers
//!
//! Raw source values arrive as `serde_json::Value` regardless of origin
//! (JSON documents, CSV cells, spreadsheet cells). Each helper returns `None`
//! when the value is absent or cannot be coerced; callers supply the column
//! default with `unwrap_or`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;

/// Spreadsheet serial day zero
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Largest serial day chrono can represent comfortably (year 9999)
const MAX_SERIAL_DAYS: f64 = 2_958_465.0;

const DATA_YEAR_RANGE: std::ops::RangeInclusive<i32> = 2010..=2030;

/// `CY 2016`, `cy2022`
#[allow(clippy::expect_used)]
static CY_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)CY\s*(\d{4})").expect("CY year pattern compiles"));

fn as_text(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then_some(trimmed)
        },
        _ => None,
    }
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => {
            let cleaned = s.trim().replace(',', "");
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
        },
        _ => None,
    }
}

/// Integer column: exact integer parse, else float parse truncated toward zero
pub fn coerce_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate_float)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| as_number(value).and_then(truncate_float))
        },
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn truncate_float(f: f64) -> Option<i64> {
    let truncated = f.trunc();
    (truncated.is_finite() && truncated >= i64::MIN as f64 && truncated <= i64::MAX as f64)
        .then_some(truncated as i64)
}

/// `coerce_int` narrowed to a 32-bit column
pub fn coerce_i32(value: Option<&Value>) -> Option<i32> {
    coerce_int(value).and_then(|v| i32::try_from(v).ok())
}

pub fn coerce_float(value: Option<&Value>) -> Option<f64> {
    as_number(value)
}

/// Text column: trimmed, blank treated as absent
///
/// Whole-number floats are rendered without the fraction so that identifiers
/// read from spreadsheets (`12345.0`) come out as `12345`.
pub fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(_) => as_text(value).map(str::to_string),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Some(i.to_string()),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e15 => Some((f as i64).to_string()),
            _ => Some(n.to_string()),
        },
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "t" => Some(true),
            "false" | "0" | "no" | "n" | "f" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Array column: never absent, scalars become a single element
pub fn coerce_array(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| coerce_string(Some(item)))
            .collect(),
        Some(scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => {
            coerce_string(Some(scalar)).into_iter().collect()
        },
        _ => Vec::new(),
    }
}

/// Column type label for a condition value
pub fn infer_data_type(value: Option<&Value>) -> &'static str {
    match value {
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "numeric",
        Some(Value::String(s)) => {
            let lowered = s.trim().to_lowercase();
            if lowered == "true" || lowered == "false" {
                "boolean"
            } else if lowered.parse::<f64>().is_ok() {
                "numeric"
            } else {
                "string"
            }
        },
        _ => "string",
    }
}

/// `DDMONYY:HH:MM:SS`, e.g. `01JAN25:15:03:00`
fn is_day_month_year_stamp(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 16
        && b[0..2].iter().all(u8::is_ascii_digit)
        && b[2..5].iter().all(u8::is_ascii_alphabetic)
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b':'
        && b[8..10].iter().all(u8::is_ascii_digit)
        && b[10] == b':'
        && b[11..13].iter().all(u8::is_ascii_digit)
        && b[13] == b':'
        && b[14..16].iter().all(u8::is_ascii_digit)
}

fn parse_iso_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    let stripped = s.strip_suffix('Z').unwrap_or(s);
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(stripped, fmt).ok())
}

/// Convert spreadsheet serial days (fractional part = time of day)
pub fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial <= 0.0 || serial > MAX_SERIAL_DAYS {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(TimeDelta::try_milliseconds(millis)?)
}

/// Timestamp column
///
/// Formats are tried most specific first: `DDMONYY:HH:MM:SS`, then ISO-8601
/// (with or without offset), then spreadsheet serial days.
pub fn coerce_timestamp(value: Option<&Value>) -> Option<NaiveDateTime> {
    if let Some(Value::Number(_)) = value {
        return as_number(value).and_then(serial_to_datetime);
    }

    let text = as_text(value)?;
    if is_day_month_year_stamp(text) {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%d%b%y:%H:%M:%S") {
            return Some(dt);
        }
    }
    if let Some(dt) = parse_iso_timestamp(text) {
        return Some(dt);
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    text.parse::<f64>().ok().and_then(serial_to_datetime)
}

/// Date column
pub fn coerce_date(value: Option<&Value>) -> Option<NaiveDate> {
    if let Some(Value::Number(_)) = value {
        return as_number(value).and_then(serial_to_datetime).map(|dt| dt.date());
    }

    let text = as_text(value)?;
    if text.contains('T') || is_day_month_year_stamp(text) {
        if let Some(dt) = coerce_timestamp(value) {
            return Some(dt.date());
        }
    }
    if let Some(date) = ["%Y-%m-%d", "%m/%d/%Y", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
    {
        return Some(date);
    }
    text.parse::<f64>()
        .ok()
        .and_then(serial_to_datetime)
        .map(|dt| dt.date())
}

fn fraction_of_day(fraction: f64) -> Option<NaiveTime> {
    if !(0.0..1.0).contains(&fraction) {
        return None;
    }
    let seconds = (fraction * 86_400.0).round() as u32 % 86_400;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)
}

/// Time-of-day column: day fractions, ISO timestamps, or clock strings
pub fn coerce_time(value: Option<&Value>) -> Option<NaiveTime> {
    if let Some(Value::Number(_)) = value {
        return as_number(value).and_then(fraction_of_day);
    }

    let text = as_text(value)?;
    if text.contains('T') {
        if let Some(dt) = parse_iso_timestamp(text) {
            return Some(dt.time());
        }
    }
    if let Some(time) = ["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M:%S %p", "%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
    {
        return Some(time);
    }
    text.parse::<f64>().ok().and_then(fraction_of_day)
}

/// Canonical column name: trimmed, lower-case, separators folded to `_`
pub fn normalize_column_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars() {
        if c.is_whitespace() || c == '-' || c == '.' || c == '_' {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('_');
        }
        pending_sep = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// Most recent plausible data year mentioned in a file path
///
/// `CY`-prefixed years (`ITA Data CY 2016`, `CY2022`) take precedence over
/// bare four-digit runs. Only 2010 through 2030 is considered.
pub fn extract_year_from_path(path: &Path) -> Option<i32> {
    let text = path.to_string_lossy();

    let prefixed = CY_YEAR
        .captures_iter(&text)
        .filter_map(|c| c.get(1)?.as_str().parse::<i32>().ok())
        .filter(|y| DATA_YEAR_RANGE.contains(y))
        .max();
    if prefixed.is_some() {
        return prefixed;
    }

    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| run.len() == 4)
        .filter_map(|run| run.parse::<i32>().ok())
        .filter(|y| DATA_YEAR_RANGE.contains(y))
        .max()
}
