//! Outbound notification contract.
//!
//! The engine renders a payload per template and hands it to a [`Notifier`].
//! Delivery transport (SES or otherwise) lives behind the trait; the
//! engine never learns how mail moves. [`LogNotifier`] is the default sink
//! when email is disabled; [`RecordingNotifier`] captures sends for tests.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Rendered message ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailPayload {
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
}

/// Outbound mail boundary. Implementations must tolerate being called
/// concurrently from multiple workers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipients: &[String], payload: &EmailPayload) -> Result<()>;
}

/// Render a template into an [`EmailPayload`].
///
/// Two templates exist: `report` (new edition published) and `alert`
/// (consecutive-failure threshold crossed). The context is the flat JSON
/// object the worker/alert coordinator assembles; `subject` is read from
/// it when present.
pub fn render(template_name: &str, context: &Value) -> EmailPayload {
    let subject = context
        .get("subject")
        .and_then(Value::as_str)
        .unwrap_or("Report update")
        .to_string();

    let body_text = match template_name {
        "alert" => format!(
            "Report {} is failing.\n\nrun_id: {}\nerror_type: {}\nlast_attempt_at: {}\n",
            ctx_str(context, "report_id"),
            ctx_str(context, "run_id"),
            ctx_str(context, "error_type"),
            ctx_str(context, "last_attempt_at"),
        ),
        _ => {
            let mut text = format!(
                "{} / {}\n\n",
                ctx_str(context, "report_name"),
                ctx_str(context, "report_date"),
            );
            if let Some(fields) = context.get("fields").and_then(Value::as_object) {
                for (k, v) in fields {
                    text.push_str(&format!("{k}: {v}\n"));
                }
            }
            if let Some(urls) = context.get("urls").and_then(Value::as_array) {
                text.push_str("\nSources:\n");
                for url in urls.iter().filter_map(Value::as_str) {
                    text.push_str(&format!("{url}\n"));
                }
            }
            text
        }
    };

    let body_html = format!(
        "<html><body><pre>{}</pre></body></html>",
        html_escape(&body_text)
    );

    EmailPayload {
        subject,
        body_text,
        body_html,
    }
}

fn ctx_str(context: &Value, key: &str) -> String {
    match context.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Sink that logs instead of sending. Used when `email_enabled` is off or
/// no transport is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipients: &[String], payload: &EmailPayload) -> Result<()> {
        tracing::info!(
            recipients = recipients.len(),
            subject = %payload.subject,
            "email suppressed (transport disabled)"
        );
        Ok(())
    }
}

/// Captures every send for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Vec<String>, EmailPayload)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Vec<String>, EmailPayload)> {
        self.sent.lock().expect("recording notifier poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("recording notifier poisoned").len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipients: &[String], payload: &EmailPayload) -> Result<()> {
        self.sent
            .lock()
            .expect("recording notifier poisoned")
            .push((recipients.to_vec(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_template_lists_fields_and_urls() {
        let payload = render(
            "report",
            &json!({
                "subject": "PK600 Morning Cash - 2026-02-09",
                "report_name": "PK600 Morning Cash",
                "report_date": "2026-02-09",
                "fields": {"head_count": 12000, "wtd_avg": 76.5},
                "urls": ["https://example.com/a"]
            }),
        );
        assert_eq!(payload.subject, "PK600 Morning Cash - 2026-02-09");
        assert!(payload.body_text.contains("head_count: 12000"));
        assert!(payload.body_text.contains("https://example.com/a"));
        assert!(payload.body_html.starts_with("<html>"));
    }

    #[test]
    fn alert_template_names_the_failure() {
        let payload = render(
            "alert",
            &json!({
                "subject": "Monitor Alert: PK600_MORNING_CASH",
                "report_id": "PK600_MORNING_CASH",
                "run_id": "1234",
                "error_type": "fetch",
                "last_attempt_at": "2026-02-09T12:00:00Z"
            }),
        );
        assert!(payload.body_text.contains("error_type: fetch"));
        assert!(payload.body_text.contains("PK600_MORNING_CASH"));
    }

    #[tokio::test]
    async fn recording_notifier_captures_sends() {
        let n = RecordingNotifier::new();
        let payload = render("report", &json!({"subject": "x"}));
        n.send(&["a@x.com".to_string()], &payload).await.unwrap();
        assert_eq!(n.sent_count(), 1);
        assert_eq!(n.sent()[0].0, vec!["a@x.com"]);
    }
}
