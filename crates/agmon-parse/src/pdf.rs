//! Morning cutout PDF document handling.
//!
//! The morning pork cutout is published as a PDF at a fixed URL instead of
//! a datamart JSON endpoint. The worker fetches the raw bytes; this module
//! extracts the first page's text, finds the primal-value table, and builds
//! the single payload row the generic row-index parser consumes.
//!
//! Text extraction degrades to an empty excerpt on unreadable bytes; the
//! run then surfaces as a parse error on the required table fields rather
//! than a fetch error.

use base64::Engine as _;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::{json, Value};

use agmon_registry::calendar::{mmddyyyy, parse_mmddyyyy};

use crate::Row;

/// Column header that precedes the daily primal-value line.
pub const TABLE_HEADER: &str = "Date Loads Carcass Loin Butt Pic Rib Ham Belly";

/// Extracted first-page text plus document page count.
#[derive(Debug, Clone, Default)]
pub struct PageText {
    pub text: String,
    pub page_count: usize,
}

/// First-page text extraction boundary.
///
/// Object-safe so the worker can hold the extractor as a trait object; the
/// default implementation reads the PDF with lopdf, tests substitute fixed
/// text.
pub trait PdfTextExtractor: Send + Sync {
    /// Extract the first page. Never fails: unreadable input yields an
    /// empty `PageText`.
    fn first_page(&self, bytes: &[u8]) -> PageText;
}

/// lopdf-backed extractor.
#[derive(Debug, Clone, Default)]
pub struct LopdfExtractor;

impl PdfTextExtractor for LopdfExtractor {
    fn first_page(&self, bytes: &[u8]) -> PageText {
        let doc = match lopdf::Document::load_mem(bytes) {
            Ok(doc) => doc,
            Err(_) => return PageText::default(),
        };
        let page_count = doc.get_pages().len();
        let text = doc.extract_text(&[1]).unwrap_or_default();
        PageText { text, page_count }
    }
}

/// Fixed-text extractor for tests and dry runs.
#[derive(Debug, Clone)]
pub struct FixedTextExtractor {
    pub text: String,
    pub page_count: usize,
}

impl PdfTextExtractor for FixedTextExtractor {
    fn first_page(&self, _bytes: &[u8]) -> PageText {
        PageText {
            text: self.text.clone(),
            page_count: self.page_count,
        }
    }
}

/// First `M/D/YYYY` date mentioned in the text, if any.
pub fn extract_report_date(text: &str) -> Option<NaiveDate> {
    static DATE_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = DATE_RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{4})\b").expect("date regex must compile")
    });
    re.captures(text)
        .and_then(|c| parse_mmddyyyy(c.get(1).map(|m| m.as_str())?))
}

/// Parse the primal-value table: the line following the header that starts
/// with the target date yields the eight value columns; an immediately
/// following `Change:` line yields the deltas (seven columns, or eight when
/// a loads delta is included).
pub fn primal_table_fields(text: &str, report_date: NaiveDate) -> Row {
    let mut fields = Row::new();
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let Some(header_idx) = lines.iter().position(|l| l.starts_with(TABLE_HEADER)) else {
        return fields;
    };

    let target = mmddyyyy(report_date);
    let mut data_line = None;
    let mut change_line = None;
    for idx in header_idx + 1..lines.len() {
        if lines[idx].starts_with(&target) {
            data_line = Some(lines[idx]);
            if let Some(next) = lines.get(idx + 1) {
                if next.starts_with("Change:") {
                    change_line = Some(*next);
                }
            }
            break;
        }
    }

    let Some(data_line) = data_line else {
        return fields;
    };
    let parts: Vec<&str> = data_line.split_whitespace().collect();
    if parts.len() < 9 {
        return fields;
    }
    for (name, part) in [
        "loads", "carcass", "loin", "butt", "pic", "rib", "ham", "belly",
    ]
    .iter()
    .zip(&parts[1..9])
    {
        fields.insert(name.to_string(), json!(part));
    }

    if let Some(change_line) = change_line {
        let change_parts: Vec<&str> = change_line
            .trim_start_matches("Change:")
            .split_whitespace()
            .collect();
        let names: &[&str] = if change_parts.len() == 7 {
            &[
                "change_carcass",
                "change_loin",
                "change_butt",
                "change_pic",
                "change_rib",
                "change_ham",
                "change_belly",
            ]
        } else if change_parts.len() >= 8 {
            &[
                "change_loads",
                "change_carcass",
                "change_loin",
                "change_butt",
                "change_pic",
                "change_rib",
                "change_ham",
                "change_belly",
            ]
        } else {
            &[]
        };
        for (name, part) in names.iter().zip(&change_parts) {
            fields.insert(name.to_string(), json!(part));
        }
    }

    fields
}

/// Build the single payload row for a fetched PDF document.
///
/// Returns the report date (from the text, else `fallback_date`) and the
/// row carrying the table fields plus document metadata.
pub fn document_payload_row(
    bytes: &[u8],
    extractor: &dyn PdfTextExtractor,
    fallback_date: NaiveDate,
) -> (NaiveDate, Row) {
    let page = extractor.first_page(bytes);
    let excerpt: String = page.text.chars().take(1000).collect();
    let report_date = extract_report_date(&excerpt).unwrap_or(fallback_date);

    let mut row = primal_table_fields(&excerpt, report_date);
    row.insert("report_date".to_string(), json!(mmddyyyy(report_date)));
    row.insert("text_excerpt".to_string(), Value::String(excerpt));
    row.insert("page_count".to_string(), json!(page.page_count));
    row.insert(
        "pdf_base64".to_string(),
        Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    );
    (report_date, row)
}
