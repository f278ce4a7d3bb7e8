//! Compiled-in default report set.
//!
//! These configs seed the durable store on first boot; afterwards the
//! store-held copies are authoritative and operator edits survive restarts
//! (the bootstrap only fills in missing keys and applies schema upgrades).

use chrono::NaiveTime;
use serde_json::json;

use crate::{
    Endpoint, PollingRule, PollingWindow, ReportConfig, ReportSchema, SelectionRule,
};

fn window(sh: u32, sm: u32, eh: u32, em: u32) -> PollingWindow {
    PollingWindow::new(
        NaiveTime::from_hms_opt(sh, sm, 0).expect("valid window start"),
        NaiveTime::from_hms_opt(eh, em, 0).expect("valid window end"),
    )
}

fn cash_polling() -> PollingRule {
    PollingRule {
        inside_cadence_sec: 300,
        outside_cadence_sec: 900,
        max_late_hours: 6,
        error_backoff_base_sec: 120,
        error_backoff_max_sec: 1800,
        jitter_sec: 30,
    }
}

fn slow_polling(max_late_hours: u32) -> PollingRule {
    PollingRule {
        inside_cadence_sec: 600,
        outside_cadence_sec: 1800,
        max_late_hours,
        error_backoff_base_sec: 180,
        error_backoff_max_sec: 3600,
        jitter_sec: 60,
    }
}

fn cash_schema(report_id: &str) -> ReportSchema {
    ReportSchema {
        report_id: report_id.to_string(),
        required_fields: ["head_count", "wtd_avg", "price_low", "price_high"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        select_rule: SelectionRule::DateMatch,
        derived_fields: vec![],
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The six monitored reports.
pub fn default_reports() -> Vec<ReportConfig> {
    vec![
        ReportConfig {
            report_id: "PK600_MORNING_CASH".to_string(),
            name: "PK600 Morning Cash".to_string(),
            endpoints: vec![Endpoint::templated(2674, "National Volume and Price Data")],
            windows: vec![window(6, 30, 9, 0)],
            polling: cash_polling(),
            needs_prior_day: false,
            date_search_window_days: 1,
            schema: cash_schema("PK600_MORNING_CASH"),
        },
        ReportConfig {
            report_id: "PK600_AFTERNOON_CASH".to_string(),
            name: "PK600 Afternoon Cash".to_string(),
            endpoints: vec![Endpoint::templated(2675, "National Volume and Price Data")],
            windows: vec![window(12, 0, 14, 30)],
            polling: cash_polling(),
            needs_prior_day: false,
            date_search_window_days: 1,
            schema: cash_schema("PK600_AFTERNOON_CASH"),
        },
        ReportConfig {
            report_id: "PK600_AFTERNOON_CUTOUT".to_string(),
            name: "PK600 Afternoon Pork Cutout".to_string(),
            endpoints: vec![
                Endpoint::templated(2498, "Cutout and Primal Values"),
                Endpoint::templated(2498, "Change From Prior Day").with_prefix("change_"),
            ],
            windows: vec![window(12, 0, 14, 30)],
            polling: cash_polling(),
            needs_prior_day: false,
            date_search_window_days: 1,
            schema: ReportSchema {
                report_id: "PK600_AFTERNOON_CUTOUT".to_string(),
                required_fields: strings(&[
                    "cutout_value",
                    "loin_value",
                    "butt_value",
                    "picnic_value",
                    "rib_value",
                    "ham_value",
                    "belly_value",
                    "change_cutout_value",
                ]),
                select_rule: SelectionRule::DateMatch,
                derived_fields: vec![],
            },
        },
        ReportConfig {
            report_id: "XB402_AFTERNOON_CUTOUT".to_string(),
            name: "XB402 Afternoon Beef Cutout".to_string(),
            endpoints: vec![
                Endpoint::templated(2453, "Current Cutout Values"),
                Endpoint::templated(2453, "Change From Prior Day").with_prefix("change_"),
                Endpoint::templated(2453, "Current Volume"),
            ],
            windows: vec![window(12, 0, 15, 0)],
            polling: cash_polling(),
            needs_prior_day: false,
            date_search_window_days: 1,
            schema: ReportSchema {
                report_id: "XB402_AFTERNOON_CUTOUT".to_string(),
                required_fields: strings(&["cutout_value", "volume"]),
                select_rule: SelectionRule::DateMatch,
                derived_fields: vec![],
            },
        },
        ReportConfig {
            report_id: "HG201_CME_INDEX".to_string(),
            name: "HG201 CME Index".to_string(),
            endpoints: vec![Endpoint::templated(2511, "Barrows/Gilts")],
            windows: vec![window(13, 0, 16, 30)],
            polling: slow_polling(8),
            needs_prior_day: true,
            date_search_window_days: 7,
            schema: ReportSchema {
                report_id: "HG201_CME_INDEX".to_string(),
                required_fields: strings(&["avg_net_price", "head_count", "avg_carcass_weight"]),
                select_rule: SelectionRule::FieldEquals {
                    field: "purchase_type".to_string(),
                    value: json!("Prod. Sold (All Purchase Types)"),
                },
                derived_fields: strings(&[
                    "index_value",
                    "two_day_total_weight",
                    "two_day_total_value",
                ]),
            },
        },
        ReportConfig {
            report_id: "PK600_MORNING_CUTOUT_PDF".to_string(),
            name: "PK600 Morning Pork Cutout (PDF)".to_string(),
            endpoints: vec![Endpoint::absolute(
                "https://www.ams.usda.gov/mnreports/ams_2496.pdf",
            )],
            windows: vec![window(6, 30, 9, 0)],
            polling: slow_polling(6),
            needs_prior_day: false,
            date_search_window_days: 1,
            schema: ReportSchema {
                report_id: "PK600_MORNING_CUTOUT_PDF".to_string(),
                required_fields: strings(&[
                    "loads",
                    "carcass",
                    "loin",
                    "butt",
                    "pic",
                    "rib",
                    "ham",
                    "belly",
                    "change_carcass",
                    "change_loin",
                    "change_butt",
                    "change_pic",
                    "change_rib",
                    "change_ham",
                    "change_belly",
                    "text_excerpt",
                    "page_count",
                ]),
                select_rule: SelectionRule::RowIndex { index: 0 },
                derived_fields: vec![],
            },
        },
    ]
}

/// Default recipient seed: `(email, name, report ids)`.
pub fn default_recipients() -> Vec<(&'static str, &'static str, Vec<&'static str>)> {
    vec![(
        "recipient@example.com",
        "Example Recipient",
        vec!["PK600_MORNING_CASH"],
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn defaults_are_valid_and_unique() {
        let reports = default_reports();
        assert_eq!(reports.len(), 6);
        let mut seen = HashSet::new();
        for r in &reports {
            r.validate().unwrap();
            assert!(seen.insert(r.report_id.clone()), "duplicate {}", r.report_id);
            assert_eq!(r.schema.report_id, r.report_id);
        }
    }

    #[test]
    fn pdf_report_is_document_endpoint() {
        let reports = default_reports();
        let pdf = reports
            .iter()
            .find(|r| r.report_id == "PK600_MORNING_CUTOUT_PDF")
            .unwrap();
        assert!(pdf.primary_endpoint().is_document());
        assert_eq!(pdf.date_search_window_days, 1);
    }

    #[test]
    fn recipients_reference_known_reports() {
        let ids: HashSet<String> = default_reports()
            .into_iter()
            .map(|r| r.report_id)
            .collect();
        for (_, _, reports) in default_recipients() {
            for id in reports {
                assert!(ids.contains(id), "unknown report {id}");
            }
        }
    }
}
