//! Report-polling engine.
//!
//! The scheduler ticks on a fixed period, computes per-report due times
//! (window cadence, failure backoff, jitter), and dispatches per-report
//! workers under a global concurrency cap. Each worker drives one
//! fetch → parse → dedupe → persist → notify run under a cross-process
//! advisory lock; the alert coordinator mails the operator after too many
//! consecutive failures. The bootstrap reconciles stored configs with the
//! compiled-in defaults and republishes the registry snapshot.

pub mod alerts;
pub mod bootstrap;
pub mod fetch;
pub mod gather;
pub mod scheduler;
pub mod worker;

pub use alerts::AlertCoordinator;
pub use bootstrap::{reconcile, reload_registry};
pub use fetch::FetchError;
pub use gather::{gather_range, GatherSummary};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use worker::{build_worker, Worker, CME_INDEX_REPORT_ID};
