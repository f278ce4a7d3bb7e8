//! CME lean-hog index computation.
//!
//! The Barrows/Gilts endpoint returns one row per reported day and purchase
//! type. The index is a two-day weighted average over the latest reported
//! day and the next-prior reported day:
//!
//! ```text
//! weight = head_count × avg_carcass_weight
//! value  = weight × avg_net_price
//! index  = Σ value / Σ weight        (both days, all categories)
//! ```
//!
//! The latest *reported* day in the payload wins, not the scheduler's
//! target date. On a day whose data is not yet published, the index is
//! computed over the two most recent published days.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::{Number, Value};

use crate::{row_date, value_as_f64, value_to_string, ParseError, ParsedFields, Payloads, ReportParser, Row, Rows};

/// Purchase-type categories entering the aggregation. Summary rows
/// ("all purchase types") are excluded.
pub const CATEGORIES: [&str; 3] = ["negotiated", "negotiated_formula", "formula"];

#[derive(Debug, Clone, Copy, Default)]
struct Aggregate {
    weight: f64,
    value: f64,
}

#[derive(Debug, Clone, Default)]
struct DayAggregate {
    by_category: BTreeMap<&'static str, Aggregate>,
}

impl DayAggregate {
    fn total(&self) -> Aggregate {
        let mut t = Aggregate::default();
        for a in self.by_category.values() {
            t.weight += a.weight;
            t.value += a.value;
        }
        t
    }
}

/// Map a purchase-type label onto an index category.
///
/// Checked most-specific first: "Negotiated Formula" must not be counted
/// as plain negotiated.
fn classify(purchase_type: &str) -> Option<&'static str> {
    let p = purchase_type.to_ascii_lowercase();
    if p.contains("all purchase types") {
        return None;
    }
    if p.contains("negotiated formula") {
        Some("negotiated_formula")
    } else if p.contains("negotiated") {
        Some("negotiated")
    } else if p.contains("formula") {
        Some("formula")
    } else {
        None
    }
}

fn row_f64(row: &Row, field: &str) -> Result<f64, ParseError> {
    let v = row
        .get(field)
        .ok_or_else(|| ParseError::MissingField(field.to_string()))?;
    value_as_f64(v).ok_or_else(|| {
        ParseError::Structure(format!("field {field} is not numeric: {}", value_to_string(v)))
    })
}

fn number(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Compute the two-day index fields for `target` from a flat row list.
///
/// Also used directly by the range-backfill path, which feeds each grouped
/// date its own two-day row slice.
pub fn compute_index_for_date(
    rows: &Rows,
    target: NaiveDate,
) -> Result<ParsedFields, ParseError> {
    let mut days: BTreeMap<NaiveDate, DayAggregate> = BTreeMap::new();
    for row in rows {
        let Some(date) = row_date(row) else { continue };
        let purchase_type = row
            .get("purchase_type")
            .map(|v| value_to_string(v))
            .unwrap_or_default();
        let Some(category) = classify(&purchase_type) else {
            continue;
        };
        let head_count = row_f64(row, "head_count")?;
        let carcass = row_f64(row, "avg_carcass_weight")?;
        let price = row_f64(row, "avg_net_price")?;

        let weight = head_count * carcass;
        let agg = days
            .entry(date)
            .or_default()
            .by_category
            .entry(category)
            .or_default();
        agg.weight += weight;
        agg.value += weight * price;
    }

    let mut reported: Vec<NaiveDate> = days.keys().copied().filter(|d| *d <= target).collect();
    reported.sort_unstable();
    let day1 = reported
        .pop()
        .ok_or_else(|| ParseError::NoMatchingRow(format!("no reported day on or before {target}")))?;
    let day2 = reported.pop().ok_or_else(|| {
        ParseError::Structure(format!("only one reported day available before {target}"))
    })?;

    let mut parsed = ParsedFields::new();
    parsed.insert("report_date".to_string(), Value::String(target.to_string()));
    parsed.insert("report_date_1".to_string(), Value::String(day1.to_string()));
    parsed.insert("report_date_2".to_string(), Value::String(day2.to_string()));

    let mut two_day = Aggregate::default();
    for (label, date) in [("day1", day1), ("day2", day2)] {
        let day = &days[&date];
        for category in CATEGORIES {
            let agg = day.by_category.get(category).copied().unwrap_or_default();
            parsed.insert(format!("{label}_{category}_weight"), number(agg.weight));
            parsed.insert(format!("{label}_{category}_value"), number(agg.value));
        }
        let total = day.total();
        parsed.insert(format!("{label}_total_weight"), number(total.weight));
        parsed.insert(format!("{label}_total_value"), number(total.value));
        two_day.weight += total.weight;
        two_day.value += total.value;
    }

    if two_day.weight <= 0.0 {
        return Err(ParseError::Structure(
            "two-day total weight is zero".to_string(),
        ));
    }
    parsed.insert("two_day_total_weight".to_string(), number(two_day.weight));
    parsed.insert("two_day_total_value".to_string(), number(two_day.value));
    parsed.insert(
        "index_value".to_string(),
        number(two_day.value / two_day.weight),
    );
    Ok(parsed)
}

/// Parser strategy wrapper over [`compute_index_for_date`].
#[derive(Debug, Clone, Default)]
pub struct CmeIndexParser;

impl ReportParser for CmeIndexParser {
    fn parse(
        &self,
        payloads: &Payloads,
        report_date: NaiveDate,
    ) -> Result<ParsedFields, ParseError> {
        let rows = payloads
            .first()
            .ok_or_else(|| ParseError::Structure("no endpoint payloads".to_string()))?;
        compute_index_for_date(rows, report_date)
    }
}
