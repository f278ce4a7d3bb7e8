//! Axum router and HTTP handlers for agmon-daemon.
//!
//! Deliberately thin: the operator CRUD surface lives elsewhere. This
//! daemon exposes health, a manual one-off run, range backfill, and a
//! registry reload hook for config edits. `build_router` is the single
//! entry point; `main.rs` attaches middleware layers so tests can use the
//! bare router.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use agmon_engine::{build_worker, gather_range, reconcile};

use crate::state::{uptime_secs, AppState};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/health", get(health_detail))
        .route("/v1/reports/:report_id/run", post(run_report))
        .route("/v1/reports/:report_id/gather", post(gather_report))
        .route("/v1/registry/reload", post(registry_reload))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub(crate) async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthDetailResponse {
    status: &'static str,
    db_ok: bool,
    db_ping_ms: Option<f64>,
    uptime_seconds: u64,
    reports: usize,
}

pub(crate) async fn health_detail(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let (db_ok, db_ping_ms) = match &st.pool {
        Some(pool) => {
            let started = std::time::Instant::now();
            match sqlx::query("select 1").execute(pool).await {
                Ok(_) => (true, Some(started.elapsed().as_secs_f64() * 1000.0)),
                Err(_) => (false, None),
            }
        }
        None => (false, None),
    };
    Json(HealthDetailResponse {
        status: "ok",
        db_ok,
        db_ping_ms,
        uptime_seconds: uptime_secs(),
        reports: st.registry.load().len(),
    })
}

// ---------------------------------------------------------------------------
// POST /v1/reports/:id/run
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
pub(crate) struct RunRequest {
    /// Optional forced report date (`YYYY-MM-DD`).
    report_date: Option<String>,
}

#[derive(Serialize)]
struct RunStartedResponse {
    status: &'static str,
    report_id: String,
}

pub(crate) async fn run_report(
    State(st): State<Arc<AppState>>,
    Path(report_id): Path<String>,
    body: Option<Json<RunRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let config = st
        .registry
        .load()
        .get(&report_id)
        .ok_or_else(|| ApiError::not_found("Report not found"))?;

    let forced = match body.and_then(|Json(b)| b.report_date) {
        Some(raw) => Some(parse_iso_date(&raw)?),
        None => None,
    };

    let state = Arc::clone(&st);
    tokio::spawn(async move {
        let mut worker = build_worker(config, state.clock, Arc::clone(&state.extractor));
        if let Some(date) = forced {
            worker = worker.with_forced_date(date);
        }
        let report_id = worker.config().report_id.clone();
        let ok = worker
            .run(&*state.store, &*state.notifier, &state.alerts)
            .await;
        if !ok {
            error!(report_id, "manual run failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(RunStartedResponse {
            status: "started",
            report_id,
        }),
    ))
}

// ---------------------------------------------------------------------------
// POST /v1/reports/:id/gather
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct GatherRequest {
    start_date: String,
    end_date: String,
}

#[derive(Serialize)]
struct GatherResponse {
    status: &'static str,
    inserted: u64,
    skipped: u64,
}

pub(crate) async fn gather_report(
    State(st): State<Arc<AppState>>,
    Path(report_id): Path<String>,
    Json(body): Json<GatherRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = st
        .registry
        .load()
        .get(&report_id)
        .ok_or_else(|| ApiError::not_found("Report not found"))?;
    let start = parse_iso_date(&body.start_date)?;
    let end = parse_iso_date(&body.end_date)?;

    let summary = gather_range(&*st.store, &config, start, end)
        .await
        .map_err(|err| ApiError::bad_request(&err.to_string()))?;

    info!(%report_id, inserted = summary.inserted, skipped = summary.skipped, "backfill done");
    Ok(Json(GatherResponse {
        status: "ok",
        inserted: summary.inserted,
        skipped: summary.skipped,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/registry/reload
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ReloadResponse {
    status: &'static str,
    reports: usize,
}

/// Re-run the store reconcile and republish the registry snapshot. The
/// external config-edit API calls this after a write; running workers
/// finish under the prior snapshot.
pub(crate) async fn registry_reload(
    State(st): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    reconcile(&*st.store, &st.registry)
        .await
        .map_err(|err| ApiError::internal(&err.to_string()))?;
    Ok(Json(ReloadResponse {
        status: "reloaded",
        reports: st.registry.load().len(),
    }))
}

// ---------------------------------------------------------------------------
// Error plumbing
// ---------------------------------------------------------------------------

pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: &str) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message: message.to_string(),
        }
    }

    fn bad_request(message: &str) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn internal(message: &str) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "detail": self.message }));
        (self.status, body).into_response()
    }
}

fn parse_iso_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request("Invalid date format (expected YYYY-MM-DD)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agmon_db::MemStore;
    use agmon_engine::AlertCoordinator;
    use agmon_notify::{LogNotifier, Notifier};
    use agmon_parse::pdf::LopdfExtractor;
    use agmon_registry::calendar::Clock;
    use agmon_registry::RegistryCell;
    use chrono_tz::America::Chicago;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        Arc::new(AppState {
            pool: None,
            store: Arc::new(MemStore::new()),
            registry: Arc::new(RegistryCell::with_defaults()),
            notifier: Arc::clone(&notifier),
            alerts: Arc::new(AlertCoordinator::new(
                notifier,
                "alerts@example.com".to_string(),
                3,
            )),
            extractor: Arc::new(LopdfExtractor),
            clock: Clock::new(Chicago),
        })
    }

    #[tokio::test]
    async fn health_is_ok_without_database() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn detailed_health_reports_db_down() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["db_ok"], false);
        assert_eq!(value["reports"], 6);
    }

    #[tokio::test]
    async fn unknown_report_run_is_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/reports/NOPE/run")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gather_rejects_bad_dates() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/reports/PK600_MORNING_CASH/gather")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"start_date": "02/09/2026", "end_date": "2026-02-09"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
