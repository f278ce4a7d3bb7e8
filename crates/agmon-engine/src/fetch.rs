//! HTTP fetch layer.
//!
//! One shared client per worker run. Every transport, timeout, non-2xx, or
//! malformed-body condition is a [`FetchError`]; the worker maps all of
//! them to `error_type = "fetch"`.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::Value;

use agmon_parse::{Payloads, Row, Rows};
use agmon_registry::calendar::mmddyyyy;
use agmon_registry::ReportConfig;

/// Fetch failures (transport or shape).
#[derive(Debug, Clone)]
pub enum FetchError {
    Transport(String),
    Status { url: String, status: u16 },
    Decode { url: String, message: String },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(msg) => write!(f, "transport error: {msg}"),
            FetchError::Status { url, status } => {
                write!(f, "http status {status} from {url}")
            }
            FetchError::Decode { url, message } => {
                write!(f, "decode error from {url}: {message}")
            }
        }
    }
}

impl std::error::Error for FetchError {}

/// Shared client with the polling timeouts: connect 5s, request 20s,
/// bounded idle keepalive.
pub fn build_client() -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(20))
        .pool_idle_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(5)
        .build()
        .map_err(|e| FetchError::Transport(e.to_string()))
}

/// GET a JSON endpoint and extract its rows.
///
/// Accepted shapes: a JSON array of row objects, or an object with a
/// `results` array. Any other shape yields zero rows.
pub async fn fetch_rows(client: &reqwest::Client, url: &str) -> Result<Rows, FetchError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body: Value = resp.json().await.map_err(|e| FetchError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    Ok(rows_from_body(body))
}

fn rows_from_body(body: Value) -> Rows {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => return Rows::new(),
        },
        _ => return Rows::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// GET raw bytes (binary documents). Non-2xx is a fetch error.
pub async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let bytes = resp.bytes().await.map_err(|e| FetchError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    Ok(bytes.to_vec())
}

/// Payloads found for one candidate report date.
#[derive(Debug, Clone)]
pub struct DatedPayloads {
    pub report_date: NaiveDate,
    pub payloads: Payloads,
    pub urls: Vec<String>,
}

/// Walk candidate dates `today, today-1, …` (bounded by the report's
/// search window, or just `forced` when set), fetching every endpoint per
/// candidate. The first candidate for which any endpoint returns at least
/// one row wins; `None` means the whole window came back empty.
pub async fn fetch_with_date_search(
    client: &reqwest::Client,
    config: &ReportConfig,
    today: NaiveDate,
    forced: Option<NaiveDate>,
) -> Result<Option<DatedPayloads>, FetchError> {
    let start = forced.unwrap_or(today);
    let search_days = if forced.is_some() {
        1
    } else {
        config.date_search_window_days as i64
    };

    for offset in 0..search_days {
        let target = start - chrono::Duration::days(offset);
        let token = mmddyyyy(target);
        let mut payloads = Payloads::new();
        let mut urls = Vec::new();
        for endpoint in &config.endpoints {
            let url = endpoint.build_url(&token);
            let rows = fetch_rows(client, &url).await?;
            urls.push(url);
            payloads.push(rows);
        }
        if payloads.iter().any(|rows| !rows.is_empty()) {
            return Ok(Some(DatedPayloads {
                report_date: target,
                payloads,
                urls,
            }));
        }
    }
    Ok(None)
}

/// Build the range token `MM/DD/YYYY:MM/DD/YYYY` and fetch one endpoint's
/// rows for the whole span.
pub async fn fetch_range_rows(
    client: &reqwest::Client,
    config: &ReportConfig,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<(String, Rows)>, FetchError> {
    let token = format!("{}:{}", mmddyyyy(start), mmddyyyy(end));
    let mut out = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        let url = endpoint.build_url(&token);
        let rows = fetch_rows(client, &url).await?;
        out.push((url, rows));
    }
    Ok(out)
}

/// Group rows by their per-row report date; rows without a parseable date
/// are dropped.
pub fn group_rows_by_date(rows: &[Row]) -> std::collections::BTreeMap<NaiveDate, Rows> {
    let mut grouped = std::collections::BTreeMap::new();
    for row in rows {
        if let Some(date) = agmon_parse::row_date(row) {
            grouped
                .entry(date)
                .or_insert_with(Rows::new)
                .push(row.clone());
        }
    }
    grouped
}
