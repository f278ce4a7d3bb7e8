//! Multi-endpoint cutout merge.
//!
//! Cutout-style reports publish their current values on the primary
//! endpoint and change-from-prior-day (or volume) sections on additional
//! endpoints. Each endpoint's row is picked by the same selection rule; a
//! non-primary endpoint's fields are merged under that endpoint's
//! configured prefix and never overwrite already-merged keys.

use chrono::NaiveDate;
use serde_json::Value;

use agmon_registry::{Endpoint, ReportSchema};

use crate::{
    is_date_key, select_row, ParseError, ParsedFields, Payloads, ReportParser,
};

#[derive(Debug, Clone)]
pub struct CutoutMergeParser {
    schema: ReportSchema,
    endpoints: Vec<Endpoint>,
}

impl CutoutMergeParser {
    pub fn new(schema: ReportSchema, endpoints: Vec<Endpoint>) -> Self {
        CutoutMergeParser { schema, endpoints }
    }
}

impl ReportParser for CutoutMergeParser {
    fn parse(
        &self,
        payloads: &Payloads,
        report_date: NaiveDate,
    ) -> Result<ParsedFields, ParseError> {
        if payloads.is_empty() {
            return Err(ParseError::Structure("no endpoint payloads".to_string()));
        }

        let mut merged = ParsedFields::new();
        for (i, rows) in payloads.iter().enumerate() {
            let row = match select_row(rows, &self.schema.select_rule, report_date) {
                Some(row) => row,
                // A change/volume section may lag the primary publication;
                // only the primary endpoint is mandatory.
                None if i == 0 => {
                    return Err(ParseError::NoMatchingRow(format!(
                        "primary endpoint has no row for {report_date}"
                    )))
                }
                None => continue,
            };
            let prefix = self
                .endpoints
                .get(i)
                .and_then(|e| e.field_prefix.as_deref())
                .filter(|_| i > 0)
                .unwrap_or("");
            for (key, value) in row {
                if is_date_key(key) {
                    continue;
                }
                let merged_key = format!("{prefix}{key}");
                merged.entry(merged_key).or_insert_with(|| value.clone());
            }
        }

        let mut parsed = ParsedFields::new();
        for field in &self.schema.required_fields {
            match merged.get(field) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use agmon_registry::SelectionRule;
    use serde_json::json;

    fn schema(required: &[&str]) -> ReportSchema {
        ReportSchema {
            report_id: "PK600_AFTERNOON_CUTOUT".to_string(),
            required_fields: required.iter().map(|s| s.to_string()).collect(),
            select_rule: SelectionRule::DateMatch,
            derived_fields: vec![],
        }
    }

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::templated(2498, "Cutout and Primal Values"),
            Endpoint::templated(2498, "Change From Prior Day").with_prefix("change_"),
        ]
    }

    fn rows(value: serde_json::Value) -> crate::Rows {
        serde_json::from_value(value).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 9).unwrap()
    }

    #[test]
    fn merges_change_fields_under_prefix() {
        let payloads = vec![
            rows(json!([{"report_date": "02/09/2026", "cutout_value": 98.5, "loin_value": 91.2}])),
            rows(json!([{"report_date": "02/09/2026", "cutout_value": 1.3, "loin_value": -0.4}])),
        ];
        let parser = CutoutMergeParser::new(
            schema(&["cutout_value", "loin_value", "change_cutout_value", "change_loin_value"]),
            endpoints(),
        );
        let parsed = parser.parse(&payloads, date()).unwrap();
        assert_eq!(parsed["cutout_value"], 98.5);
        assert_eq!(parsed["change_cutout_value"], 1.3);
        assert_eq!(parsed["change_loin_value"], -0.4);
        assert_eq!(parsed["report_date"], "2026-02-09");
    }

    #[test]
    fn missing_change_section_is_tolerated_unless_required() {
        let payloads = vec![
            rows(json!([{"report_date": "02/09/2026", "cutout_value": 98.5}])),
            rows(json!([])),
        ];
        let parser = CutoutMergeParser::new(schema(&["cutout_value"]), endpoints());
        let parsed = parser.parse(&payloads, date()).unwrap();
        assert_eq!(parsed["cutout_value"], 98.5);

        let parser = CutoutMergeParser::new(
            schema(&["cutout_value", "change_cutout_value"]),
            endpoints(),
        );
        let payloads = vec![
            rows(json!([{"report_date": "02/09/2026", "cutout_value": 98.5}])),
            rows(json!([])),
        ];
        let err = parser.parse(&payloads, date()).unwrap_err();
        assert_eq!(err, ParseError::MissingField("change_cutout_value".to_string()));
    }

    #[test]
    fn primary_endpoint_miss_is_parse_error() {
        let payloads = vec![
            rows(json!([{"report_date": "02/06/2026", "cutout_value": 98.5}])),
            rows(json!([{"report_date": "02/09/2026", "cutout_value": 1.0}])),
        ];
        let parser = CutoutMergeParser::new(schema(&["cutout_value"]), endpoints());
        assert!(matches!(
            parser.parse(&payloads, date()).unwrap_err(),
            ParseError::NoMatchingRow(_)
        ));
    }

    #[test]
    fn primary_fields_win_over_later_endpoints() {
        // third endpoint without prefix must not clobber the primary value
        let eps = vec![
            Endpoint::templated(2453, "Current Cutout Values"),
            Endpoint::templated(2453, "Current Volume"),
        ];
        let payloads = vec![
            rows(json!([{"report_date": "02/09/2026", "cutout_value": 330.1}])),
            rows(json!([{"report_date": "02/09/2026", "cutout_value": 999.0, "volume": 112}])),
        ];
        let parser = CutoutMergeParser::new(
            ReportSchema {
                report_id: "XB402_AFTERNOON_CUTOUT".to_string(),
                required_fields: vec!["cutout_value".to_string(), "volume".to_string()],
                select_rule: SelectionRule::DateMatch,
                derived_fields: vec![],
            },
            eps,
        );
        let parsed = parser.parse(&payloads, date()).unwrap();
        assert_eq!(parsed["cutout_value"], 330.1);
        assert_eq!(parsed["volume"], 112);
    }
}
