//! In-memory [`Store`] used by scenario tests (`testkit` feature).
//!
//! Semantics mirror [`PgStore`]: triple uniqueness on versions, atomic
//! failure counters, advisory locks as a held-key set. Inspection helpers
//! expose runs/versions/events so tests can assert the §8 invariants.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    merge_parsed_fields, AlertStateRow, ErrorKind, PublishOutcome, RunRow, RunState, Store,
    StoredReport, VersionRow,
};

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: Uuid,
    pub report_run_id: Uuid,
    pub event_type: String,
    pub message: Option<String>,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    reports: Vec<StoredReport>,
    runs: HashMap<Uuid, RunRow>,
    run_order: Vec<Uuid>,
    versions: Vec<VersionRow>,
    events: Vec<EventRow>,
    alerts: HashMap<String, AlertStateRow>,
    recipients: Vec<RecipientRow>,
    links: HashSet<(Uuid, String)>,
    locks: HashSet<String>,
}

#[derive(Debug, Clone)]
struct RecipientRow {
    id: Uuid,
    email: String,
    name: Option<String>,
    is_active: bool,
}

#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mem store poisoned")
    }

    // -- inspection helpers for tests --------------------------------------

    pub fn runs_for(&self, report_id: &str) -> Vec<RunRow> {
        let inner = self.lock();
        inner
            .run_order
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .filter(|r| r.report_id == report_id)
            .cloned()
            .collect()
    }

    pub fn versions_for(&self, report_id: &str) -> Vec<VersionRow> {
        self.lock()
            .versions
            .iter()
            .filter(|v| v.report_id == report_id)
            .cloned()
            .collect()
    }

    pub fn events_for(&self, run_id: Uuid) -> Vec<EventRow> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.report_run_id == run_id)
            .cloned()
            .collect()
    }

    /// Pre-hold a report lock, simulating another process mid-run.
    pub fn hold_lock_externally(&self, report_id: &str) {
        self.lock().locks.insert(report_id.to_string());
    }

    pub fn set_recipient_active(&self, email: &str, active: bool) {
        let mut inner = self.lock();
        if let Some(r) = inner.recipients.iter_mut().find(|r| r.email == email) {
            r.is_active = active;
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn stored_reports(&self) -> Result<Vec<StoredReport>> {
        Ok(self.lock().reports.clone())
    }

    async fn get_report(&self, report_id: &str) -> Result<Option<StoredReport>> {
        Ok(self
            .lock()
            .reports
            .iter()
            .find(|r| r.report_id == report_id)
            .cloned())
    }

    async fn upsert_report_config(
        &self,
        report_id: &str,
        name: &str,
        config: &Value,
    ) -> Result<()> {
        let mut inner = self.lock();
        match inner.reports.iter_mut().find(|r| r.report_id == report_id) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.config = config.clone();
            }
            None => inner.reports.push(StoredReport {
                report_id: report_id.to_string(),
                name: name.to_string(),
                config: config.clone(),
            }),
        }
        Ok(())
    }

    async fn create_run(&self, report_id: &str) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        let mut inner = self.lock();
        inner.runs.insert(
            run_id,
            RunRow {
                id: run_id,
                report_id: report_id.to_string(),
                report_date: None,
                state: RunState::WaitingForPublication,
                attempt: 1,
                run_started_at: Utc::now(),
                run_finished_at: None,
                error_type: None,
                error_message: None,
                payload_hash: None,
            },
        );
        inner.run_order.push(run_id);
        Ok(run_id)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        report_date: Option<NaiveDate>,
        state: RunState,
        payload_hash: Option<&str>,
        error: Option<(ErrorKind, &str)>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("unknown run {run_id}"))?;
        run.report_date = report_date;
        run.state = state;
        run.payload_hash = payload_hash.map(str::to_string);
        run.run_finished_at = Some(Utc::now());
        let (event_type, message) = match error {
            Some((kind, msg)) => {
                run.error_type = Some(kind.as_str().to_string());
                run.error_message = Some(msg.to_string());
                ("error".to_string(), msg.to_string())
            }
            None => (state.as_str().to_string(), state.as_str().to_string()),
        };
        inner.events.push(EventRow {
            id: Uuid::new_v4(),
            report_run_id: run_id,
            event_type,
            message: Some(message),
            data: None,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn append_run_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        message: Option<&str>,
        data: Option<Value>,
    ) -> Result<()> {
        self.lock().events.push(EventRow {
            id: Uuid::new_v4(),
            report_run_id: run_id,
            event_type: event_type.to_string(),
            message: message.map(str::to_string),
            data,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn version_hashes(
        &self,
        report_id: &str,
        report_date: NaiveDate,
    ) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .versions
            .iter()
            .filter(|v| v.report_id == report_id && v.report_date == report_date)
            .map(|v| v.payload_hash.clone())
            .collect())
    }

    async fn find_version(
        &self,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
    ) -> Result<Option<VersionRow>> {
        Ok(self
            .lock()
            .versions
            .iter()
            .find(|v| {
                v.report_id == report_id
                    && v.report_date == report_date
                    && v.payload_hash == payload_hash
            })
            .cloned())
    }

    async fn publish_version(
        &self,
        run_id: Uuid,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
        parsed_fields: &Value,
        raw_payload: &Value,
    ) -> Result<PublishOutcome> {
        let mut inner = self.lock();
        let duplicate = inner.versions.iter().any(|v| {
            v.report_id == report_id
                && v.report_date == report_date
                && v.payload_hash == payload_hash
        });

        let outcome = if duplicate {
            PublishOutcome::DuplicateHash
        } else {
            let version_id = Uuid::new_v4();
            inner.versions.push(VersionRow {
                id: version_id,
                report_id: report_id.to_string(),
                report_date,
                payload_hash: payload_hash.to_string(),
                parsed_fields: parsed_fields.clone(),
                raw_payload: raw_payload.clone(),
                created_at: Utc::now(),
            });
            PublishOutcome::Inserted { version_id }
        };

        let state = match outcome {
            PublishOutcome::Inserted { .. } => RunState::PublishedNew,
            PublishOutcome::DuplicateHash => RunState::PublishedNoChange,
        };
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("unknown run {run_id}"))?;
        run.report_date = Some(report_date);
        run.state = state;
        run.payload_hash = Some(payload_hash.to_string());
        run.run_finished_at = Some(Utc::now());
        inner.events.push(EventRow {
            id: Uuid::new_v4(),
            report_run_id: run_id,
            event_type: state.as_str().to_string(),
            message: Some(state.as_str().to_string()),
            data: None,
            created_at: Utc::now(),
        });
        Ok(outcome)
    }

    async fn insert_version(
        &self,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
        parsed_fields: &Value,
        raw_payload: &Value,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let duplicate = inner.versions.iter().any(|v| {
            v.report_id == report_id
                && v.report_date == report_date
                && v.payload_hash == payload_hash
        });
        if duplicate {
            return Ok(false);
        }
        inner.versions.push(VersionRow {
            id: Uuid::new_v4(),
            report_id: report_id.to_string(),
            report_date,
            payload_hash: payload_hash.to_string(),
            parsed_fields: parsed_fields.clone(),
            raw_payload: raw_payload.clone(),
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn merge_version_fields(&self, version_id: Uuid, fields: &Value) -> Result<()> {
        let mut inner = self.lock();
        let version = inner
            .versions
            .iter_mut()
            .find(|v| v.id == version_id)
            .ok_or_else(|| anyhow!("unknown version {version_id}"))?;
        version.parsed_fields = merge_parsed_fields(&version.parsed_fields, fields);
        Ok(())
    }

    async fn alert_record_failure(&self, report_id: &str) -> Result<i64> {
        let mut inner = self.lock();
        let now = Utc::now();
        let state = inner
            .alerts
            .entry(report_id.to_string())
            .or_insert_with(|| AlertStateRow {
                report_id: report_id.to_string(),
                consecutive_failures: 0,
                last_failure_at: None,
                updated_at: now,
            });
        state.consecutive_failures += 1;
        state.last_failure_at = Some(now);
        state.updated_at = now;
        Ok(state.consecutive_failures)
    }

    async fn alert_clear(&self, report_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(state) = inner.alerts.get_mut(report_id) {
            state.consecutive_failures = 0;
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn alert_state(&self, report_id: &str) -> Result<Option<AlertStateRow>> {
        Ok(self.lock().alerts.get(report_id).cloned())
    }

    async fn active_recipients(&self, report_id: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut out: Vec<String> = inner
            .recipients
            .iter()
            .filter(|r| r.is_active)
            .filter(|r| inner.links.contains(&(r.id, report_id.to_string())))
            .map(|r| r.email.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    async fn ensure_recipient(&self, email: &str, name: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        if inner.recipients.iter().any(|r| r.email == email) {
            return Ok(());
        }
        inner.recipients.push(RecipientRow {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: name.map(str::to_string),
            is_active: true,
        });
        Ok(())
    }

    async fn link_recipient_report(&self, email: &str, report_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let Some(id) = inner
            .recipients
            .iter()
            .find(|r| r.email == email)
            .map(|r| r.id)
        else {
            return Ok(());
        };
        inner.links.insert((id, report_id.to_string()));
        Ok(())
    }

    async fn try_acquire_report_lock(&self, report_id: &str) -> Result<bool> {
        Ok(self.lock().locks.insert(report_id.to_string()))
    }

    async fn release_report_lock(&self, report_id: &str) {
        self.lock().locks.remove(report_id);
    }
}
