//! Spec scenario: repeated fetch failures raise an operator alert at the
//! threshold; the next success clears the counter.

mod common;

use common::*;
use httpmock::prelude::*;
use serde_json::json;

use agmon_db::{RunState, Store};
use agmon_registry::SelectionRule;

const REPORT_ID: &str = "PK600_AFTERNOON_CASH";

#[tokio::test]
async fn three_fetch_errors_alert_then_recovery_clears() {
    let server = MockServer::start_async().await;
    let h = Harness::new(3);
    let config = json_report(
        REPORT_ID,
        &server.base_url(),
        2675,
        &["head_count"],
        SelectionRule::DateMatch,
    );

    let mut failing = server
        .mock_async(|when, then| {
            when.method(GET).path("/2675/rows");
            then.status(500).body("upstream exploded");
        })
        .await;

    let monday = date(2026, 2, 9);

    // failures 1 and 2: below threshold, no mail
    assert!(!h.run_worker(&config, Some(monday)).await);
    assert!(!h.run_worker(&config, Some(monday)).await);
    assert_eq!(h.notifier.sent_count(), 0);

    // failure 3: threshold reached, one alert to the master address
    assert!(!h.run_worker(&config, Some(monday)).await);
    assert_eq!(h.notifier.sent_count(), 1);
    let (recipients, payload) = &h.notifier.sent()[0];
    assert_eq!(recipients, &vec![MASTER_ALERT_EMAIL.to_string()]);
    assert!(payload.subject.contains(REPORT_ID));
    assert!(payload.body_text.contains("error_type: fetch"));

    // failure 4: at-or-above threshold fires again (no debouncing)
    assert!(!h.run_worker(&config, Some(monday)).await);
    assert_eq!(h.notifier.sent_count(), 2);

    let runs = h.store.runs_for(REPORT_ID);
    assert_eq!(runs.len(), 4);
    for run in &runs {
        assert_eq!(run.state, RunState::ErrorFetch);
        assert_eq!(run.error_type.as_deref(), Some("fetch"));
        assert!(run.error_message.is_some());
    }
    assert!(h.store.versions_for(REPORT_ID).is_empty());

    // recovery
    failing.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/2675/rows");
            then.status(200).json_body(json!([
                {"report_date": "02/09/2026", "head_count": 9000}
            ]));
        })
        .await;

    assert!(h.run_worker(&config, Some(monday)).await);
    let failures = h
        .store
        .alert_state(REPORT_ID)
        .await
        .unwrap()
        .unwrap()
        .consecutive_failures;
    assert_eq!(failures, 0);
    assert_eq!(h.store.versions_for(REPORT_ID).len(), 1);
}
