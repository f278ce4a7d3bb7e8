//! Document-endpoint report: raw bytes are fetched once, the first page's
//! text yields the table row, and dedup works on the derived payload.

mod common;

use std::sync::Arc;

use common::*;
use httpmock::prelude::*;

use agmon_db::{RunState, Store};
use agmon_parse::pdf::FixedTextExtractor;
use agmon_registry::{
    Endpoint, ReportConfig, ReportSchema, SelectionRule,
};

const REPORT_ID: &str = "PK600_MORNING_CUTOUT_PDF";

const PAGE_TEXT: &str = "\
National Daily Pork Report FOB Plant - Morning
For 02/09/2026

Date Loads Carcass Loin Butt Pic Rib Ham Belly
02/09/2026 180.55 98.45 91.20 102.33 60.18 148.90 88.12 112.46
Change: 1.30 -0.44 2.10 0.63 -1.28 0.91 3.02
";

fn pdf_config(url: &str) -> ReportConfig {
    let mut config = json_report(REPORT_ID, "http://unused", 0, &[], SelectionRule::DateMatch);
    config.endpoints = vec![Endpoint::absolute(url)];
    config.schema = ReportSchema {
        report_id: REPORT_ID.to_string(),
        required_fields: [
            "loads",
            "carcass",
            "loin",
            "butt",
            "pic",
            "rib",
            "ham",
            "belly",
            "change_carcass",
            "change_belly",
            "text_excerpt",
            "page_count",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        select_rule: SelectionRule::RowIndex { index: 0 },
        derived_fields: vec![],
    };
    config
}

#[tokio::test]
async fn pdf_report_publishes_table_fields_and_dedupes() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/ams_2496.pdf");
            then.status(200).body("%PDF-1.4 fake bytes");
        })
        .await;

    let h = Harness::new(3);
    let config = pdf_config(&format!("{}/ams_2496.pdf", server.base_url()));
    let extractor = Arc::new(FixedTextExtractor {
        text: PAGE_TEXT.to_string(),
        page_count: 2,
    });

    assert!(
        h.run_worker_with_extractor(&config, None, extractor.clone())
            .await
    );

    let versions = h.store.versions_for(REPORT_ID);
    assert_eq!(versions.len(), 1);
    // the report date comes from the document text, not the wall clock
    assert_eq!(versions[0].report_date, date(2026, 2, 9));
    let fields = versions[0].parsed_fields.as_object().unwrap();
    assert_eq!(fields["loads"], "180.55");
    assert_eq!(fields["belly"], "112.46");
    assert_eq!(fields["change_carcass"], "1.30");
    assert_eq!(fields["page_count"], 2);
    assert!(fields["text_excerpt"].as_str().unwrap().contains("Carcass"));

    assert_eq!(h.store.runs_for(REPORT_ID)[0].state, RunState::PublishedNew);

    // identical bytes + identical extraction → no change
    assert!(
        h.run_worker_with_extractor(&config, None, extractor)
            .await
    );
    assert_eq!(h.store.versions_for(REPORT_ID).len(), 1);
    assert_eq!(
        h.store.runs_for(REPORT_ID)[1].state,
        RunState::PublishedNoChange
    );
}

#[tokio::test]
async fn unreadable_document_is_error_parse() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/ams_2496.pdf");
            then.status(200).body("not a pdf at all");
        })
        .await;

    let h = Harness::new(3);
    let config = pdf_config(&format!("{}/ams_2496.pdf", server.base_url()));
    // real extractor: bytes do not parse, table fields never materialize
    assert!(!h.run_worker(&config, None).await);
    assert_eq!(h.store.runs_for(REPORT_ID)[0].state, RunState::ErrorParse);
    assert!(h.store.versions_for(REPORT_ID).is_empty());

    let failures = h
        .store
        .alert_state(REPORT_ID)
        .await
        .unwrap()
        .unwrap()
        .consecutive_failures;
    assert_eq!(failures, 1);
}
