//! Report registry: configuration types, compiled-in defaults, and the
//! process-wide snapshot cell.
//!
//! Configurations are immutable per live-override generation. The durable
//! store keeps one JSON document per report (`reports.config`); this crate
//! owns the (de)serialization shape of that document, so the bootstrap can
//! merge operator edits against the compiled-in defaults and republish.

pub mod calendar;
pub mod defaults;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Base URL of the upstream datamart report service.
pub const API_BASE: &str = "https://mpr.datamart.ams.usda.gov/services/v1.1/reports";

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One upstream endpoint of a report.
///
/// Either a templated datamart URL built from `report_number` and
/// `report_path`, or a fixed absolute URL (binary-format documents).
/// Order within [`ReportConfig::endpoints`] is meaningful: the first
/// endpoint is primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub report_number: u32,
    #[serde(default)]
    pub report_path: String,
    /// Fixed URL that bypasses the datamart template (e.g. a PDF document).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_url: Option<String>,
    /// Overrides [`API_BASE`] for templated endpoints (mirrors, staging).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Prefix applied to fields merged from this endpoint when it is not
    /// the primary one (e.g. `change_` for change-from-prior-day sections).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_prefix: Option<String>,
}

impl Endpoint {
    pub fn templated(report_number: u32, report_path: &str) -> Self {
        Endpoint {
            report_number,
            report_path: report_path.to_string(),
            absolute_url: None,
            base_url: None,
            field_prefix: None,
        }
    }

    pub fn absolute(url: &str) -> Self {
        Endpoint {
            report_number: 0,
            report_path: String::new(),
            absolute_url: Some(url.to_string()),
            base_url: None,
            field_prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.field_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    pub fn is_document(&self) -> bool {
        self.absolute_url.is_some()
    }

    /// Build the fetch URL for a date token (`MM/DD/YYYY` or
    /// `MM/DD/YYYY:MM/DD/YYYY`). Absolute endpoints ignore the token.
    pub fn build_url(&self, date_token: &str) -> String {
        match &self.absolute_url {
            Some(url) => url.clone(),
            None => {
                let base = self
                    .base_url
                    .as_deref()
                    .unwrap_or(API_BASE)
                    .trim_end_matches('/');
                format!(
                    "{base}/{}/{}?q=report_date={}",
                    self.report_number, self.report_path, date_token
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Polling windows and rule
// ---------------------------------------------------------------------------

/// Local-time interval during which the upstream is expected to publish.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl PollingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        PollingWindow { start, end }
    }

    /// Inclusive membership test against a local clock time.
    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Cadence, backoff, and jitter parameters for one report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollingRule {
    pub inside_cadence_sec: u32,
    pub outside_cadence_sec: u32,
    pub max_late_hours: u32,
    pub error_backoff_base_sec: u32,
    pub error_backoff_max_sec: u32,
    pub jitter_sec: u32,
}

impl PollingRule {
    pub fn validate(&self) -> Result<()> {
        if self.inside_cadence_sec == 0 || self.outside_cadence_sec == 0 {
            return Err(anyhow!("polling cadences must be > 0"));
        }
        if self.error_backoff_base_sec > self.error_backoff_max_sec {
            return Err(anyhow!(
                "error_backoff_base_sec {} exceeds error_backoff_max_sec {}",
                self.error_backoff_base_sec,
                self.error_backoff_max_sec
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selection rule and schema
// ---------------------------------------------------------------------------

/// Strategy for picking the row that represents the report edition inside
/// an endpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionRule {
    /// First row whose date field equals the target date (`MM/DD/YYYY`).
    DateMatch,
    /// Row at a fixed position; out of range is a parse error.
    RowIndex { index: usize },
    /// First row where `str(row[field]) == str(value)`; falls back to the
    /// first row when nothing matches.
    FieldEquals { field: String, value: Value },
}

/// Field contract of one report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSchema {
    pub report_id: String,
    pub required_fields: Vec<String>,
    pub select_rule: SelectionRule,
    #[serde(default)]
    pub derived_fields: Vec<String>,
}

// ---------------------------------------------------------------------------
// ReportConfig
// ---------------------------------------------------------------------------

/// Full configuration of one monitored report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub report_id: String,
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    pub windows: Vec<PollingWindow>,
    pub polling: PollingRule,
    #[serde(default)]
    pub needs_prior_day: bool,
    #[serde(default = "default_search_window")]
    pub date_search_window_days: u32,
    pub schema: ReportSchema,
}

fn default_search_window() -> u32 {
    1
}

impl ReportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.report_id.is_empty() {
            return Err(anyhow!("report_id must not be empty"));
        }
        if self.endpoints.is_empty() {
            return Err(anyhow!("report {} has no endpoints", self.report_id));
        }
        if self.date_search_window_days == 0 {
            return Err(anyhow!(
                "report {} date_search_window_days must be >= 1",
                self.report_id
            ));
        }
        self.polling
            .validate()
            .with_context(|| format!("report {} polling rule invalid", self.report_id))?;
        Ok(())
    }

    pub fn primary_endpoint(&self) -> &Endpoint {
        &self.endpoints[0]
    }

    /// Serialize to the JSON document persisted in the store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("report config serialization must not fail")
    }

    /// Parse a persisted JSON document, enforcing invariants.
    pub fn from_value(value: &Value) -> Result<Self> {
        let config: ReportConfig =
            serde_json::from_value(value.clone()).context("report config json invalid")?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Registry snapshot cell
// ---------------------------------------------------------------------------

/// Immutable view of the live report set.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    reports: Vec<Arc<ReportConfig>>,
    by_id: HashMap<String, usize>,
}

impl RegistrySnapshot {
    pub fn new(reports: Vec<ReportConfig>) -> Self {
        let reports: Vec<Arc<ReportConfig>> = reports.into_iter().map(Arc::new).collect();
        let by_id = reports
            .iter()
            .enumerate()
            .map(|(i, r)| (r.report_id.clone(), i))
            .collect();
        RegistrySnapshot { reports, by_id }
    }

    /// Reports in registry order (dispatch order for the scheduler).
    pub fn reports(&self) -> &[Arc<ReportConfig>] {
        &self.reports
    }

    pub fn get(&self, report_id: &str) -> Option<Arc<ReportConfig>> {
        self.by_id
            .get(report_id)
            .map(|&i| Arc::clone(&self.reports[i]))
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

/// Process-wide configuration cell.
///
/// One writer (the bootstrap/reload path) publishes whole new immutable
/// snapshots; readers clone an `Arc` per scheduler tick or per worker run
/// and never observe a half-updated registry.
#[derive(Debug)]
pub struct RegistryCell {
    inner: RwLock<Arc<RegistrySnapshot>>,
}

impl RegistryCell {
    pub fn new(reports: Vec<ReportConfig>) -> Self {
        RegistryCell {
            inner: RwLock::new(Arc::new(RegistrySnapshot::new(reports))),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(defaults::default_reports())
    }

    pub fn load(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.inner.read().expect("registry cell poisoned"))
    }

    pub fn publish(&self, reports: Vec<ReportConfig>) {
        let snapshot = Arc::new(RegistrySnapshot::new(reports));
        *self.inner.write().expect("registry cell poisoned") = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> PollingRule {
        PollingRule {
            inside_cadence_sec: 300,
            outside_cadence_sec: 900,
            max_late_hours: 6,
            error_backoff_base_sec: 120,
            error_backoff_max_sec: 1800,
            jitter_sec: 30,
        }
    }

    fn sample_config() -> ReportConfig {
        ReportConfig {
            report_id: "TEST_REPORT".to_string(),
            name: "Test Report".to_string(),
            endpoints: vec![Endpoint::templated(1234, "Some Section")],
            windows: vec![PollingWindow::new(
                NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            )],
            polling: rule(),
            needs_prior_day: false,
            date_search_window_days: 1,
            schema: ReportSchema {
                report_id: "TEST_REPORT".to_string(),
                required_fields: vec!["head_count".to_string()],
                select_rule: SelectionRule::DateMatch,
                derived_fields: vec![],
            },
        }
    }

    #[test]
    fn templated_url_includes_date_token() {
        let e = Endpoint::templated(2674, "National Volume and Price Data");
        let url = e.build_url("02/09/2026");
        assert_eq!(
            url,
            format!("{API_BASE}/2674/National Volume and Price Data?q=report_date=02/09/2026")
        );
    }

    #[test]
    fn base_url_override_replaces_default_host() {
        let e = Endpoint::templated(2674, "cash").with_base_url("http://127.0.0.1:5000/");
        assert_eq!(
            e.build_url("02/09/2026"),
            "http://127.0.0.1:5000/2674/cash?q=report_date=02/09/2026"
        );
    }

    #[test]
    fn absolute_url_ignores_date_token() {
        let e = Endpoint::absolute("https://example.com/report.pdf");
        assert_eq!(e.build_url("02/09/2026"), "https://example.com/report.pdf");
        assert!(e.is_document());
    }

    #[test]
    fn window_membership_is_inclusive() {
        let w = PollingWindow::new(
            NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        );
        assert!(w.contains(NaiveTime::from_hms_opt(6, 30, 0).unwrap()));
        assert!(w.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(9, 0, 1).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(6, 29, 59).unwrap()));
    }

    #[test]
    fn polling_rule_rejects_base_above_max() {
        let mut r = rule();
        r.error_backoff_base_sec = 7200;
        assert!(r.validate().is_err());
    }

    #[test]
    fn config_json_round_trip() {
        let config = sample_config();
        let value = config.to_value();
        let parsed = ReportConfig::from_value(&value).unwrap();
        assert_eq!(parsed, config);
        // windows persist as local clock strings
        assert_eq!(value["windows"][0]["start"], "06:30:00");
    }

    #[test]
    fn from_value_enforces_invariants() {
        let mut value = sample_config().to_value();
        value["date_search_window_days"] = serde_json::json!(0);
        assert!(ReportConfig::from_value(&value).is_err());
    }

    #[test]
    fn selection_rule_tagged_form() {
        let rule = SelectionRule::FieldEquals {
            field: "purchase_type".to_string(),
            value: serde_json::json!("Prod. Sold (All Purchase Types)"),
        };
        let v = serde_json::to_value(&rule).unwrap();
        assert_eq!(v["type"], "field_equals");
        let back: SelectionRule = serde_json::from_value(v).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn registry_cell_publishes_new_snapshot() {
        let cell = RegistryCell::new(vec![sample_config()]);
        let before = cell.load();
        assert_eq!(before.len(), 1);

        let mut edited = sample_config();
        edited.name = "Edited".to_string();
        cell.publish(vec![edited]);

        let after = cell.load();
        assert_eq!(after.get("TEST_REPORT").unwrap().name, "Edited");
        // the old snapshot is unchanged for readers that still hold it
        assert_eq!(before.get("TEST_REPORT").unwrap().name, "Test Report");
    }
}
