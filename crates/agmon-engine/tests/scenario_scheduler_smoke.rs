//! Scheduler end to end: one registry report is dispatched on the first
//! tick, not re-dispatched inside its cadence, and drains on shutdown.

mod common;

use std::sync::Arc;

use common::*;
use httpmock::prelude::*;
use serde_json::json;
use tokio::sync::watch;

use agmon_engine::{AlertCoordinator, Scheduler, SchedulerOptions};
use agmon_notify::{Notifier, RecordingNotifier};
use agmon_parse::pdf::LopdfExtractor;
use agmon_registry::calendar::Clock;
use agmon_registry::{RegistryCell, SelectionRule};
use chrono_tz::America::Chicago;

const REPORT_ID: &str = "PK600_MORNING_CASH";

#[tokio::test]
async fn first_tick_dispatches_once_then_shutdown_drains() {
    let server = MockServer::start_async().await;
    // empty rows for any candidate date: every run ends waiting/holiday
    server
        .mock_async(|when, then| {
            when.method(GET).path("/2674/rows");
            then.status(200).json_body(json!({"results": []}));
        })
        .await;

    let store = Arc::new(agmon_db::MemStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let alerts = Arc::new(AlertCoordinator::new(
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        MASTER_ALERT_EMAIL.to_string(),
        3,
    ));
    let registry = Arc::new(RegistryCell::new(vec![json_report(
        REPORT_ID,
        &server.base_url(),
        2674,
        &["head_count"],
        SelectionRule::DateMatch,
    )]));

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn agmon_db::Store>,
        registry,
        notifier as Arc<dyn Notifier>,
        alerts,
        Arc::new(LopdfExtractor),
        Clock::new(Chicago),
        SchedulerOptions {
            poll_tick_seconds: 1,
            max_concurrency: 2,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    // three ticks elapse; the 300s cadence allows only the first dispatch
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let runs = store.runs_for(REPORT_ID);
    assert_eq!(runs.len(), 1, "one dispatch per quiet period");
    assert!(runs[0].run_finished_at.is_some(), "worker drained on shutdown");
}
