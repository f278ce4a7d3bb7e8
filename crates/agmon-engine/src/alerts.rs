//! Operator alerting on consecutive report failures.
//!
//! The counter lives in the durable store (`alert_state`); this coordinator
//! owns the threshold check and the outbound alert mail. No debouncing
//! beyond the threshold: every failure at or above it mails the operator.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use agmon_db::{ErrorKind, Store};
use agmon_notify::{render, Notifier};

pub struct AlertCoordinator {
    notifier: Arc<dyn Notifier>,
    master_alert_email: String,
    threshold: u32,
}

impl AlertCoordinator {
    pub fn new(notifier: Arc<dyn Notifier>, master_alert_email: String, threshold: u32) -> Self {
        AlertCoordinator {
            notifier,
            master_alert_email,
            threshold,
        }
    }

    /// Record one failure; alert the operator when the consecutive count
    /// reaches the threshold. Store errors are logged, never propagated;
    /// alerting must not change a run's outcome.
    pub async fn record_failure(
        &self,
        store: &dyn Store,
        report_id: &str,
        run_id: Uuid,
        error_kind: ErrorKind,
    ) {
        let count = match store.alert_record_failure(report_id).await {
            Ok(count) => count,
            Err(err) => {
                error!(report_id, error = %err, "failure counter update failed");
                return;
            }
        };
        if count < self.threshold as i64 {
            return;
        }

        info!(report_id, consecutive_failures = count, "alert threshold reached");
        let context = json!({
            "subject": format!("Report Monitor Alert: {report_id}"),
            "report_id": report_id,
            "run_id": run_id.to_string(),
            "error_type": error_kind.as_str(),
            "last_attempt_at": Utc::now().to_rfc3339(),
        });
        let payload = render("alert", &context);
        if let Err(err) = self
            .notifier
            .send(std::slice::from_ref(&self.master_alert_email), &payload)
            .await
        {
            warn!(report_id, error = %err, "alert mail send failed");
        }
    }

    /// Reset the counter after any successful terminal state.
    pub async fn clear_failure(&self, store: &dyn Store, report_id: &str) {
        if let Err(err) = store.alert_clear(report_id).await {
            error!(report_id, error = %err, "failure counter clear failed");
        }
    }
}
