//! Shared wiring for engine scenario tests: an in-memory store, a
//! recording notifier, and a worker runner against a mock HTTP server.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;

use agmon_db::MemStore;
use agmon_engine::{build_worker, AlertCoordinator};
use agmon_notify::{Notifier, RecordingNotifier};
use agmon_parse::pdf::{LopdfExtractor, PdfTextExtractor};
use agmon_registry::calendar::Clock;
use agmon_registry::{
    Endpoint, PollingRule, PollingWindow, ReportConfig, ReportSchema, SelectionRule,
};
use chrono_tz::America::Chicago;

pub const MASTER_ALERT_EMAIL: &str = "alerts@example.com";

pub struct Harness {
    pub store: Arc<MemStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: AlertCoordinator,
    pub clock: Clock,
}

impl Harness {
    pub fn new(threshold: u32) -> Self {
        let store = Arc::new(MemStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let alerts = AlertCoordinator::new(
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            MASTER_ALERT_EMAIL.to_string(),
            threshold,
        );
        Harness {
            store,
            notifier,
            alerts,
            clock: Clock::new(Chicago),
        }
    }

    pub async fn run_worker(&self, config: &ReportConfig, forced: Option<NaiveDate>) -> bool {
        self.run_worker_with_extractor(config, forced, Arc::new(LopdfExtractor))
            .await
    }

    pub async fn run_worker_with_extractor(
        &self,
        config: &ReportConfig,
        forced: Option<NaiveDate>,
        extractor: Arc<dyn PdfTextExtractor>,
    ) -> bool {
        let mut worker = build_worker(Arc::new(config.clone()), self.clock, extractor);
        if let Some(date) = forced {
            worker = worker.with_forced_date(date);
        }
        worker
            .run(&*self.store, &*self.notifier, &self.alerts)
            .await
    }

    pub async fn subscribe(&self, email: &str, report_id: &str) {
        use agmon_db::Store;
        self.store.ensure_recipient(email, None).await.unwrap();
        self.store
            .link_recipient_report(email, report_id)
            .await
            .unwrap();
    }
}

pub fn polling() -> PollingRule {
    PollingRule {
        inside_cadence_sec: 300,
        outside_cadence_sec: 900,
        max_late_hours: 6,
        error_backoff_base_sec: 120,
        error_backoff_max_sec: 1800,
        jitter_sec: 30,
    }
}

/// Single-endpoint JSON report pointed at a mock server.
pub fn json_report(
    report_id: &str,
    base_url: &str,
    report_number: u32,
    required: &[&str],
    select_rule: SelectionRule,
) -> ReportConfig {
    ReportConfig {
        report_id: report_id.to_string(),
        name: format!("{report_id} (test)"),
        endpoints: vec![Endpoint::templated(report_number, "rows").with_base_url(base_url)],
        windows: vec![PollingWindow::new(
            chrono::NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        )],
        polling: polling(),
        needs_prior_day: false,
        date_search_window_days: 1,
        schema: ReportSchema {
            report_id: report_id.to_string(),
            required_fields: required.iter().map(|s| s.to_string()).collect(),
            select_rule,
            derived_fields: vec![],
        },
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}
