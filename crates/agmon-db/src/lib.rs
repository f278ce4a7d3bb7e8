//! Durable store for the report-polling engine.
//!
//! [`Store`] abstracts exactly the persistence operations the engine needs:
//! run lifecycle, version dedup/insert under the `(report_id, report_date,
//! payload_hash)` uniqueness constraint, alert counters, recipients, stored
//! report configs, and the per-report cross-process advisory lock.
//!
//! [`PgStore`] is the production implementation (sqlx/Postgres, embedded
//! migrations). The `testkit` feature adds [`MemStore`], an in-process
//! implementation with the same semantics, so scenario tests run without a
//! database.

pub mod pg;

#[cfg(feature = "testkit")]
pub mod mem;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::Uuid;

pub use pg::PgStore;

#[cfg(feature = "testkit")]
pub use mem::MemStore;

// ---------------------------------------------------------------------------
// Run state and error taxonomy
// ---------------------------------------------------------------------------

/// Terminal and in-flight states of one polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    WaitingForPublication,
    PublishedNew,
    PublishedNoChange,
    HolidayOrNoReport,
    ErrorFetch,
    ErrorParse,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::WaitingForPublication => "waiting_for_publication",
            RunState::PublishedNew => "published_new",
            RunState::PublishedNoChange => "published_no_change",
            RunState::HolidayOrNoReport => "holiday_or_no_report",
            RunState::ErrorFetch => "error_fetch",
            RunState::ErrorParse => "error_parse",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "waiting_for_publication" => Ok(RunState::WaitingForPublication),
            "published_new" => Ok(RunState::PublishedNew),
            "published_no_change" => Ok(RunState::PublishedNoChange),
            "holiday_or_no_report" => Ok(RunState::HolidayOrNoReport),
            "error_fetch" => Ok(RunState::ErrorFetch),
            "error_parse" => Ok(RunState::ErrorParse),
            other => Err(anyhow!("invalid run state: {}", other)),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RunState::ErrorFetch | RunState::ErrorParse)
    }
}

/// Persisted `error_type` values, also used for alert routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fetch,
    Parse,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::Parse => "parse",
        }
    }

    pub fn run_state(&self) -> RunState {
        match self {
            ErrorKind::Fetch => RunState::ErrorFetch,
            ErrorKind::Parse => RunState::ErrorParse,
        }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: Uuid,
    pub report_id: String,
    pub report_date: Option<NaiveDate>,
    pub state: RunState,
    pub attempt: i32,
    pub run_started_at: DateTime<Utc>,
    pub run_finished_at: Option<DateTime<Utc>>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub payload_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VersionRow {
    pub id: Uuid,
    pub report_id: String,
    pub report_date: NaiveDate,
    pub payload_hash: String,
    pub parsed_fields: Value,
    pub raw_payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AlertStateRow {
    pub report_id: String,
    pub consecutive_failures: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub report_id: String,
    pub name: String,
    pub config: Value,
}

/// Result of a transactional version publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new version row exists; the run finalized as `published_new`.
    Inserted { version_id: Uuid },
    /// Another writer already holds the same `(report_id, report_date,
    /// payload_hash)`; the run finalized as `published_no_change`.
    DuplicateHash,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Abstract durable store. One implementor per backing technology; all
/// cross-process coordination (advisory lock, uniqueness races) lives
/// behind this boundary.
#[async_trait]
pub trait Store: Send + Sync {
    // -- report configs ----------------------------------------------------

    async fn stored_reports(&self) -> Result<Vec<StoredReport>>;

    async fn get_report(&self, report_id: &str) -> Result<Option<StoredReport>>;

    async fn upsert_report_config(
        &self,
        report_id: &str,
        name: &str,
        config: &Value,
    ) -> Result<()>;

    // -- runs --------------------------------------------------------------

    /// Create a run in `waiting_for_publication` and return its id.
    async fn create_run(&self, report_id: &str) -> Result<Uuid>;

    /// Set a run's terminal state, stamp `run_finished_at`, and append the
    /// matching run event (event type = state, or `error` with the message
    /// for failures), atomically.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        report_date: Option<NaiveDate>,
        state: RunState,
        payload_hash: Option<&str>,
        error: Option<(ErrorKind, &str)>,
    ) -> Result<()>;

    async fn append_run_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        message: Option<&str>,
        data: Option<Value>,
    ) -> Result<()>;

    // -- versions ----------------------------------------------------------

    /// Payload hashes of all versions stored for `(report_id, report_date)`.
    async fn version_hashes(&self, report_id: &str, report_date: NaiveDate)
        -> Result<Vec<String>>;

    async fn find_version(
        &self,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
    ) -> Result<Option<VersionRow>>;

    /// Insert a version and finalize its run in one transaction, honoring
    /// the triple uniqueness constraint. The transaction commits before
    /// this returns, so callers may notify afterwards without risking a
    /// rolled-back insert.
    async fn publish_version(
        &self,
        run_id: Uuid,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
        parsed_fields: &Value,
        raw_payload: &Value,
    ) -> Result<PublishOutcome>;

    /// Plain version insert for the range-backfill path (no run attached).
    /// Returns false when the triple already exists.
    async fn insert_version(
        &self,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
        parsed_fields: &Value,
        raw_payload: &Value,
    ) -> Result<bool>;

    /// Key-wise merge of `fields` onto an existing version's parsed fields:
    /// new keys are added, existing keys are overwritten only by non-null
    /// values.
    async fn merge_version_fields(&self, version_id: Uuid, fields: &Value) -> Result<()>;

    // -- alert state -------------------------------------------------------

    /// Atomically increment the consecutive-failure counter, stamping
    /// `last_failure_at`; returns the new count.
    async fn alert_record_failure(&self, report_id: &str) -> Result<i64>;

    /// Reset the counter to zero (no-op when no state row exists).
    async fn alert_clear(&self, report_id: &str) -> Result<()>;

    async fn alert_state(&self, report_id: &str) -> Result<Option<AlertStateRow>>;

    // -- recipients --------------------------------------------------------

    /// Active recipient addresses subscribed to a report.
    async fn active_recipients(&self, report_id: &str) -> Result<Vec<String>>;

    async fn ensure_recipient(&self, email: &str, name: Option<&str>) -> Result<()>;

    async fn link_recipient_report(&self, email: &str, report_id: &str) -> Result<()>;

    // -- advisory lock -----------------------------------------------------

    /// Non-blocking: true iff the caller now holds the per-report lock.
    async fn try_acquire_report_lock(&self, report_id: &str) -> Result<bool>;

    /// Release a held lock; never fails the caller (a broken lock
    /// connection is discarded instead).
    async fn release_report_lock(&self, report_id: &str);
}

// ---------------------------------------------------------------------------
// Parsed-field merge
// ---------------------------------------------------------------------------

/// Merge `new` onto `existing` key-wise: new keys added, existing keys
/// preserved unless the new value is non-null.
pub fn merge_parsed_fields(existing: &Value, new: &Value) -> Value {
    let (Some(existing_map), Some(new_map)) = (existing.as_object(), new.as_object()) else {
        return if new.is_null() {
            existing.clone()
        } else {
            new.clone()
        };
    };
    let mut merged = existing_map.clone();
    for (k, v) in new_map {
        match merged.get(k) {
            Some(_) if v.is_null() => {}
            _ => {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(merged)
}
