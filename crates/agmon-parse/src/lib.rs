//! Parser dispatch: turns fetched endpoint payloads into the canonical
//! parsed-field mapping for one report edition.
//!
//! Payload rows are duck-typed JSON objects (upstream varies field presence
//! and date-key casing); parsed output always contains `report_date` (ISO)
//! plus every field the report schema requires. Failures here are parse
//! failures, never fetch failures; the worker persists the distinction.

pub mod cutout;
pub mod hash;
pub mod index;
pub mod pdf;

use std::fmt;

use chrono::NaiveDate;
use serde_json::Value;

use agmon_registry::calendar::{mmddyyyy, parse_mmddyyyy};
use agmon_registry::{ReportSchema, SelectionRule};

/// One upstream row: a string-keyed JSON object.
pub type Row = serde_json::Map<String, Value>;
/// All rows of one endpoint.
pub type Rows = Vec<Row>;
/// One list of rows per endpoint, in endpoint order.
pub type Payloads = Vec<Rows>;
/// The canonical parsed-field mapping of one edition.
pub type ParsedFields = serde_json::Map<String, Value>;

/// Date keys accepted on upstream rows, first match wins.
pub const ROW_DATE_KEYS: [&str; 4] = ["report_date", "report date", "reportdate", "Report Date"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Parse failures, persisted as `error_type = "parse"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The selection rule matched no row.
    NoMatchingRow(String),
    /// A schema-required field is absent (or null) on the selected row.
    MissingField(String),
    /// The payload shape does not fit the parser.
    Structure(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NoMatchingRow(msg) => write!(f, "no matching row: {msg}"),
            ParseError::MissingField(field) => write!(f, "required field missing: {field}"),
            ParseError::Structure(msg) => write!(f, "payload structure mismatch: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Row access helpers
// ---------------------------------------------------------------------------

/// Stringify a JSON value the way upstream comparisons expect: strings
/// verbatim, everything else via its JSON rendering.
pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric coercion tolerating decimal strings with thousands separators
/// (`"12,345"`), which the upstream mixes freely with JSON numbers.
pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
}

/// Calendar date of a row, read from the first present date-key alias.
pub fn row_date(row: &Row) -> Option<NaiveDate> {
    for key in ROW_DATE_KEYS {
        if let Some(v) = row.get(key) {
            if let Some(d) = parse_mmddyyyy(&value_to_string(v)) {
                return Some(d);
            }
        }
    }
    None
}

pub(crate) fn is_date_key(key: &str) -> bool {
    ROW_DATE_KEYS.contains(&key)
}

// ---------------------------------------------------------------------------
// Row selection
// ---------------------------------------------------------------------------

/// Apply a selection rule to one endpoint's rows.
///
/// `RowIndex` out of range and `DateMatch` with no matching date both yield
/// `None` (a parse error at the caller); `FieldEquals` falls back to the
/// first row when nothing matches.
pub fn select_row<'a>(
    rows: &'a [Row],
    rule: &SelectionRule,
    report_date: NaiveDate,
) -> Option<&'a Row> {
    match rule {
        SelectionRule::RowIndex { index } => rows.get(*index),
        SelectionRule::DateMatch => {
            let target = mmddyyyy(report_date);
            rows.iter().find(|row| {
                ROW_DATE_KEYS.iter().any(|key| {
                    row.get(*key)
                        .map(|v| value_to_string(v).trim() == target)
                        .unwrap_or(false)
                })
            })
        }
        SelectionRule::FieldEquals { field, value } => {
            let target = value_to_string(value);
            rows.iter()
                .find(|row| {
                    row.get(field)
                        .map(|v| value_to_string(v) == target)
                        .unwrap_or(false)
                })
                .or_else(|| rows.first())
        }
    }
}

// ---------------------------------------------------------------------------
// Parser trait + generic implementation
// ---------------------------------------------------------------------------

/// Strategy turning endpoint payloads into parsed fields.
///
/// Implementations must be object-safe; workers hold a `Box<dyn
/// ReportParser>` chosen by report id at registry-build time.
pub trait ReportParser: Send + Sync {
    fn parse(&self, payloads: &Payloads, report_date: NaiveDate)
        -> Result<ParsedFields, ParseError>;
}

/// Generic parser: select one row from the primary endpoint and emit the
/// schema-required fields plus `report_date` (ISO).
#[derive(Debug, Clone)]
pub struct RowFieldsParser {
    schema: ReportSchema,
}

impl RowFieldsParser {
    pub fn new(schema: ReportSchema) -> Self {
        RowFieldsParser { schema }
    }
}

impl ReportParser for RowFieldsParser {
    fn parse(
        &self,
        payloads: &Payloads,
        report_date: NaiveDate,
    ) -> Result<ParsedFields, ParseError> {
        let rows = payloads
            .first()
            .ok_or_else(|| ParseError::Structure("no endpoint payloads".to_string()))?;
        let row = select_row(rows, &self.schema.select_rule, report_date)
            .ok_or_else(|| ParseError::NoMatchingRow(mmddyyyy(report_date)))?;

        let mut parsed = ParsedFields::new();
        for field in &self.schema.required_fields {
            match row.get(field) {
                Some(v) if !v.is_null() => {
                    parsed.insert(field.clone(), v.clone());
                }
                _ => return Err(ParseError::MissingField(field.clone())),
            }
        }
        parsed.insert(
            "report_date".to_string(),
            Value::String(report_date.to_string()),
        );
        Ok(parsed)
    }
}
