//! Per-report worker: one `run()` drives the full
//! acquire-lock → fetch → parse → dedupe → persist → notify → release
//! state machine and reports a boolean success back to the scheduler.
//!
//! No error crosses this boundary: fetch/parse failures finalize the run
//! with the matching `error_type`, record the failure with the alert
//! coordinator, and return `false`. A contended advisory lock returns
//! `true` without creating a run row: another process owns this tick.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agmon_db::{ErrorKind, PublishOutcome, RunState, Store};
use agmon_notify::{render, Notifier};
use agmon_parse::cutout::CutoutMergeParser;
use agmon_parse::hash::payload_hash;
use agmon_parse::index::CmeIndexParser;
use agmon_parse::pdf::{document_payload_row, PdfTextExtractor};
use agmon_parse::{ParsedFields, ReportParser, RowFieldsParser};
use agmon_registry::calendar::{is_weekend, Clock};
use agmon_registry::ReportConfig;

use crate::alerts::AlertCoordinator;
use crate::fetch::{
    build_client, fetch_bytes, fetch_with_date_search, DatedPayloads, FetchError,
};

/// Report whose parser computes the two-day CME index.
pub const CME_INDEX_REPORT_ID: &str = "HG201_CME_INDEX";

pub struct Worker {
    config: Arc<ReportConfig>,
    parser: Box<dyn ReportParser>,
    extractor: Arc<dyn PdfTextExtractor>,
    clock: Clock,
    forced_report_date: Option<NaiveDate>,
}

/// Choose the parser strategy for a report: the CME index report
/// aggregates all rows, multi-endpoint reports merge sections, everything
/// else selects a single row.
pub fn build_parser(config: &ReportConfig) -> Box<dyn ReportParser> {
    if config.report_id == CME_INDEX_REPORT_ID {
        Box::new(CmeIndexParser)
    } else if config.endpoints.len() > 1 {
        Box::new(CutoutMergeParser::new(
            config.schema.clone(),
            config.endpoints.clone(),
        ))
    } else {
        Box::new(RowFieldsParser::new(config.schema.clone()))
    }
}

pub fn build_worker(
    config: Arc<ReportConfig>,
    clock: Clock,
    extractor: Arc<dyn PdfTextExtractor>,
) -> Worker {
    let parser = build_parser(&config);
    Worker {
        config,
        parser,
        extractor,
        clock,
        forced_report_date: None,
    }
}

impl Worker {
    pub fn with_forced_date(mut self, date: NaiveDate) -> Self {
        self.forced_report_date = Some(date);
        self
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Execute one polling run. Returns `true` on any non-failure outcome.
    pub async fn run(
        &self,
        store: &dyn Store,
        notifier: &dyn Notifier,
        alerts: &AlertCoordinator,
    ) -> bool {
        let report_id = self.config.report_id.as_str();
        match store.try_acquire_report_lock(report_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(report_id, "report lock held elsewhere, skipping tick");
                return true;
            }
            Err(err) => {
                error!(report_id, error = %err, "advisory lock acquire failed");
                return false;
            }
        }

        let ok = self.run_locked(store, notifier, alerts).await;
        store.release_report_lock(report_id).await;
        ok
    }

    async fn run_locked(
        &self,
        store: &dyn Store,
        notifier: &dyn Notifier,
        alerts: &AlertCoordinator,
    ) -> bool {
        let report_id = self.config.report_id.as_str();
        let run_id = match store.create_run(report_id).await {
            Ok(id) => id,
            Err(err) => {
                error!(report_id, error = %err, "run row create failed");
                return false;
            }
        };

        let client = match build_client() {
            Ok(c) => c,
            Err(err) => {
                return self
                    .fail(store, alerts, run_id, None, ErrorKind::Fetch, &err.to_string())
                    .await
            }
        };

        let today = self.clock.today_local();
        let fetched = match self.fetch(&client, today).await {
            Ok(f) => f,
            Err(err) => {
                return self
                    .fail(store, alerts, run_id, None, ErrorKind::Fetch, &err.to_string())
                    .await
            }
        };

        let Some(dated) = fetched else {
            // Nothing published across the whole search window.
            let target = self.forced_report_date.unwrap_or(today);
            let state = if is_weekend(target) {
                RunState::HolidayOrNoReport
            } else {
                RunState::WaitingForPublication
            };
            if let Err(err) = store
                .finalize_run(run_id, Some(target), state, None, None)
                .await
            {
                error!(report_id, error = %err, "finalize failed");
                return false;
            }
            if state == RunState::HolidayOrNoReport {
                alerts.clear_failure(store, report_id).await;
            }
            return true;
        };

        let parsed = match self.parser.parse(&dated.payloads, dated.report_date) {
            Ok(p) => p,
            Err(err) => {
                return self
                    .fail(
                        store,
                        alerts,
                        run_id,
                        Some(dated.report_date),
                        ErrorKind::Parse,
                        &err.to_string(),
                    )
                    .await
            }
        };

        let hash = payload_hash(&dated.payloads);
        let parsed_value = Value::Object(parsed.clone());
        let raw_payload = json!({
            "payloads": &dated.payloads,
            "urls": &dated.urls,
        });

        let outcome = match store
            .publish_version(
                run_id,
                report_id,
                dated.report_date,
                &hash,
                &parsed_value,
                &raw_payload,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                return self
                    .fail(
                        store,
                        alerts,
                        run_id,
                        Some(dated.report_date),
                        ErrorKind::Fetch,
                        &format!("persist failed: {err}"),
                    )
                    .await
            }
        };

        alerts.clear_failure(store, report_id).await;

        match outcome {
            PublishOutcome::Inserted { .. } => {
                info!(report_id, report_date = %dated.report_date, "published new edition");
                // The version transaction is committed; a notify failure
                // must not fail the run.
                self.notify(store, notifier, &parsed, dated.report_date, &dated.urls)
                    .await;
            }
            PublishOutcome::DuplicateHash => {
                debug!(report_id, report_date = %dated.report_date, "edition unchanged");
            }
        }
        true
    }

    async fn fetch(
        &self,
        client: &reqwest::Client,
        today: NaiveDate,
    ) -> Result<Option<DatedPayloads>, FetchError> {
        let primary = self.config.primary_endpoint();
        if primary.is_document() {
            let url = primary.build_url("");
            let bytes = fetch_bytes(client, &url).await?;
            let fallback = self.forced_report_date.unwrap_or(today);
            let (report_date, row) =
                document_payload_row(&bytes, self.extractor.as_ref(), fallback);
            Ok(Some(DatedPayloads {
                report_date,
                payloads: vec![vec![row]],
                urls: vec![url],
            }))
        } else {
            fetch_with_date_search(client, &self.config, today, self.forced_report_date).await
        }
    }

    async fn notify(
        &self,
        store: &dyn Store,
        notifier: &dyn Notifier,
        parsed: &ParsedFields,
        report_date: NaiveDate,
        urls: &[String],
    ) {
        let report_id = self.config.report_id.as_str();
        let recipients = match store.active_recipients(report_id).await {
            Ok(r) => r,
            Err(err) => {
                warn!(report_id, error = %err, "recipient lookup failed, skipping notify");
                return;
            }
        };
        if recipients.is_empty() {
            return;
        }
        let context = json!({
            "subject": format!("{} - {}", self.config.name, report_date),
            "report_id": report_id,
            "report_name": self.config.name,
            "report_date": report_date.to_string(),
            "fields": parsed,
            "urls": urls,
        });
        let payload = render("report", &context);
        if let Err(err) = notifier.send(&recipients, &payload).await {
            warn!(report_id, error = %err, "notification send failed");
        }
    }

    async fn fail(
        &self,
        store: &dyn Store,
        alerts: &AlertCoordinator,
        run_id: Uuid,
        report_date: Option<NaiveDate>,
        kind: ErrorKind,
        message: &str,
    ) -> bool {
        let report_id = self.config.report_id.as_str();
        warn!(report_id, %run_id, error_type = kind.as_str(), error = message, "run failed");
        if let Err(err) = store
            .finalize_run(run_id, report_date, kind.run_state(), None, Some((kind, message)))
            .await
        {
            error!(report_id, error = %err, "failure finalize failed");
        }
        alerts.record_failure(store, report_id, run_id, kind).await;
        false
    }
}
