//! Range backfill: one request per endpoint covers the whole span, rows
//! group by their own dates, and each date inserts or merges a version.

mod common;

use common::*;
use httpmock::prelude::*;
use serde_json::json;

use agmon_engine::{gather_range, GatherSummary};
use agmon_registry::SelectionRule;

const REPORT_ID: &str = "PK600_MORNING_CASH";

#[tokio::test]
async fn backfill_inserts_then_merges_then_creates_siblings() {
    let server = MockServer::start_async().await;
    let h = Harness::new(3);
    let config = json_report(
        REPORT_ID,
        &server.base_url(),
        2674,
        &["head_count"],
        SelectionRule::DateMatch,
    );

    let mut range = server
        .mock_async(|when, then| {
                when.method(GET)
                    .path("/2674/rows")
                    .query_param("q", "report_date=02/05/2026:02/09/2026");
                then.status(200).json_body(json!({
                    "results": [
                        {"report_date": "02/05/2026", "head_count": 8000},
                        {"report_date": "02/06/2026", "head_count": 8500},
                        {"report_date": "02/09/2026", "head_count": 12000}
                    ]
                }));
            })
            .await;

        let summary = gather_range(&*h.store, &config, date(2026, 2, 5), date(2026, 2, 9))
            .await
            .unwrap();
        assert_eq!(
            summary,
            GatherSummary {
                inserted: 3,
                skipped: 0
            }
        );
        assert_eq!(h.store.versions_for(REPORT_ID).len(), 3);

        // replay: every date matches an existing hash and merges instead
        let summary = gather_range(&*h.store, &config, date(2026, 2, 5), date(2026, 2, 9))
            .await
            .unwrap();
        assert_eq!(
            summary,
            GatherSummary {
                inserted: 0,
                skipped: 3
            }
        );
        assert_eq!(h.store.versions_for(REPORT_ID).len(), 3);

        // revised value for one date → new hash → sibling version row
        range.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/2674/rows")
                    .query_param("q", "report_date=02/05/2026:02/09/2026");
                then.status(200).json_body(json!({
                    "results": [
                        {"report_date": "02/05/2026", "head_count": 8000},
                        {"report_date": "02/06/2026", "head_count": 8500},
                        {"report_date": "02/09/2026", "head_count": 12500}
                    ]
                }));
            })
            .await;

        let summary = gather_range(&*h.store, &config, date(2026, 2, 5), date(2026, 2, 9))
            .await
            .unwrap();
        assert_eq!(
            summary,
            GatherSummary {
                inserted: 1,
                skipped: 2
            }
        );
        let versions = h.store.versions_for(REPORT_ID);
        assert_eq!(versions.len(), 4);
        let feb9: Vec<_> = versions
            .iter()
            .filter(|v| v.report_date == date(2026, 2, 9))
            .collect();
        assert_eq!(feb9.len(), 2, "new hash for an existing date is a sibling");
    }

    #[tokio::test]
    async fn backfill_merge_enriches_existing_fields() {
        let server = MockServer::start_async().await;
        let h = Harness::new(3);
        let config = json_report(
            REPORT_ID,
            &server.base_url(),
            2674,
            &["head_count"],
            SelectionRule::DateMatch,
        );
        server
            .mock_async(|when, then| {
            when.method(GET).path("/2674/rows");
            then.status(200).json_body(json!([
                {"report_date": "02/09/2026", "head_count": 12000, "wtd_avg": 76.5}
            ]));
        })
        .await;

    gather_range(&*h.store, &config, date(2026, 2, 9), date(2026, 2, 9))
        .await
        .unwrap();

    // an operator widens the schema; the re-gather merges the new field
    // onto the same version row instead of duplicating it
    let mut widened = config.clone();
    widened.schema.required_fields = vec!["head_count".to_string(), "wtd_avg".to_string()];
    let summary = gather_range(&*h.store, &widened, date(2026, 2, 9), date(2026, 2, 9))
        .await
        .unwrap();
    assert_eq!(
        summary,
        GatherSummary {
            inserted: 0,
            skipped: 1
        }
    );
    let versions = h.store.versions_for(REPORT_ID);
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].parsed_fields["wtd_avg"], 76.5);
    assert_eq!(versions[0].parsed_fields["head_count"], 12000);
}

#[tokio::test]
async fn index_report_backfills_each_day_with_a_prior_day() {
    let server = MockServer::start_async().await;
    let h = Harness::new(3);
    let config = json_report(
        "HG201_CME_INDEX",
        &server.base_url(),
        2511,
        &["avg_net_price"],
        SelectionRule::DateMatch,
    );
    let mut rows_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/2511/rows");
            then.status(200).json_body(json!([
                {"report_date": "02/05/2026", "purchase_type": "Negotiated",
                 "head_count": 10, "avg_carcass_weight": 200, "avg_net_price": 70.0},
                {"report_date": "02/06/2026", "purchase_type": "Negotiated",
                 "head_count": 10, "avg_carcass_weight": 200, "avg_net_price": 71.0},
                {"report_date": "02/09/2026", "purchase_type": "Negotiated",
                 "head_count": 10, "avg_carcass_weight": 200, "avg_net_price": 72.0}
            ]));
        })
        .await;

    let summary = gather_range(&*h.store, &config, date(2026, 2, 5), date(2026, 2, 9))
        .await
        .unwrap();
    // the earliest fetched day has no prior day to aggregate with
    assert_eq!(
        summary,
        GatherSummary {
            inserted: 2,
            skipped: 1
        }
    );

    let versions = h.store.versions_for("HG201_CME_INDEX");
    assert_eq!(versions.len(), 2);
    let feb9 = versions
        .iter()
        .find(|v| v.report_date == date(2026, 2, 9))
        .unwrap();
    assert_eq!(feb9.parsed_fields["report_date_1"], "2026-02-09");
    assert_eq!(feb9.parsed_fields["report_date_2"], "2026-02-06");
    let index = feb9.parsed_fields["index_value"].as_f64().unwrap();
    assert!((index - 71.5).abs() < 1e-9);
    let feb9_hash = feb9.payload_hash.clone();

    // replay: every computable date matches its existing hash and merges
    let summary = gather_range(&*h.store, &config, date(2026, 2, 5), date(2026, 2, 9))
        .await
        .unwrap();
    assert_eq!(
        summary,
        GatherSummary {
            inserted: 0,
            skipped: 3
        }
    );
    assert_eq!(h.store.versions_for("HG201_CME_INDEX").len(), 2);

    // a later day appears upstream: extending the range must only add the
    // new date, because each date's hash covers its own two-day slice
    rows_mock.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/2511/rows");
            then.status(200).json_body(json!([
                {"report_date": "02/05/2026", "purchase_type": "Negotiated",
                 "head_count": 10, "avg_carcass_weight": 200, "avg_net_price": 70.0},
                {"report_date": "02/06/2026", "purchase_type": "Negotiated",
                 "head_count": 10, "avg_carcass_weight": 200, "avg_net_price": 71.0},
                {"report_date": "02/09/2026", "purchase_type": "Negotiated",
                 "head_count": 10, "avg_carcass_weight": 200, "avg_net_price": 72.0},
                {"report_date": "02/10/2026", "purchase_type": "Negotiated",
                 "head_count": 10, "avg_carcass_weight": 200, "avg_net_price": 73.0}
            ]));
        })
        .await;

    let summary = gather_range(&*h.store, &config, date(2026, 2, 5), date(2026, 2, 10))
        .await
        .unwrap();
    assert_eq!(
        summary,
        GatherSummary {
            inserted: 1,
            skipped: 3
        }
    );
    let versions = h.store.versions_for("HG201_CME_INDEX");
    assert_eq!(versions.len(), 3, "prior dates merged, no sibling rows");
    let feb9 = versions
        .iter()
        .find(|v| v.report_date == date(2026, 2, 9))
        .unwrap();
    assert_eq!(feb9.payload_hash, feb9_hash, "unchanged date keeps its hash");
    let feb10 = versions
        .iter()
        .find(|v| v.report_date == date(2026, 2, 10))
        .unwrap();
    assert_eq!(feb10.parsed_fields["report_date_2"], "2026-02-09");
}

#[tokio::test]
async fn backfill_rejects_bad_ranges_and_documents() {
    let h = Harness::new(3);
    let config = json_report(
        REPORT_ID,
        "http://unused",
        2674,
        &["head_count"],
        SelectionRule::DateMatch,
    );
    assert!(
        gather_range(&*h.store, &config, date(2026, 2, 9), date(2026, 2, 5))
            .await
            .is_err()
    );

    let mut pdf = config.clone();
    pdf.endpoints = vec![agmon_registry::Endpoint::absolute("http://unused/x.pdf")];
    assert!(
        gather_range(&*h.store, &pdf, date(2026, 2, 5), date(2026, 2, 9))
            .await
            .is_err()
    );
}
