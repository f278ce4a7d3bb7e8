//! Bootstrap and live-override reconciliation.
//!
//! On startup (and after a config edit) the store is reconciled against the
//! compiled-in defaults: missing reports are inserted, stored configs gain
//! any missing top-level keys from the default (operator edits win), known
//! stale schema shapes are upgraded, and the registry snapshot is
//! republished from the store so edits take effect. A stored config that
//! fails to parse is logged as `config_invalid` and the compiled-in default
//! stays in effect for that report.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use agmon_db::Store;
use agmon_registry::defaults::{default_recipients, default_reports};
use agmon_registry::{RegistryCell, ReportConfig};

/// Deep merge-missing: keys absent from `current` are filled from
/// `default`; nested objects recurse; an empty/null list is replaced by the
/// default's list. Present scalar values are never touched.
pub fn merge_missing(current: &Value, default: &Value) -> Value {
    let (Some(current_map), Some(default_map)) = (current.as_object(), default.as_object()) else {
        return current.clone();
    };
    let mut merged = current_map.clone();
    for (key, default_value) in default_map {
        match merged.get(key) {
            None => {
                merged.insert(key.clone(), default_value.clone());
            }
            Some(existing) if existing.is_object() && default_value.is_object() => {
                let recursed = merge_missing(existing, default_value);
                merged.insert(key.clone(), recursed);
            }
            Some(existing) if default_value.is_array() && is_emptyish(existing) => {
                merged.insert(key.clone(), default_value.clone());
            }
            Some(_) => {}
        }
    }
    Value::Object(merged)
}

fn is_emptyish(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Report-specific config upgrades: swap in the default's required fields
/// when the stored list still matches a known stale shape.
pub fn upgrade_report_config(report_id: &str, mut config: Value, default: &Value) -> Value {
    let stale: Option<Value> = match report_id {
        "PK600_AFTERNOON_CUTOUT" => Some(serde_json::json!(["cutout_value", "primal_value"])),
        "HG201_CME_INDEX" => Some(serde_json::json!(["avg_net_price", "head_count"])),
        _ => None,
    };
    let Some(stale) = stale else { return config };

    let is_stale = config
        .pointer("/schema/required_fields")
        .map(|current| *current == stale)
        .unwrap_or(false);
    if !is_stale {
        return config;
    }
    if let (Some(target), Some(replacement)) = (
        config.pointer_mut("/schema/required_fields"),
        default.pointer("/schema/required_fields"),
    ) {
        info!(report_id, "upgrading stale required_fields shape");
        *target = replacement.clone();
    }
    config
}

/// Seed defaults, merge/upgrade stored configs, seed recipients, and
/// republish the registry from the store.
pub async fn reconcile(store: &dyn Store, registry: &RegistryCell) -> Result<()> {
    for default in default_reports() {
        let default_value = default.to_value();
        match store.get_report(&default.report_id).await? {
            None => {
                info!(report_id = %default.report_id, "seeding default report config");
                store
                    .upsert_report_config(&default.report_id, &default.name, &default_value)
                    .await?;
            }
            Some(stored) => {
                let merged = merge_missing(&stored.config, &default_value);
                let upgraded =
                    upgrade_report_config(&default.report_id, merged, &default_value);
                if upgraded != stored.config {
                    let name = upgraded
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(&default.name)
                        .to_string();
                    store
                        .upsert_report_config(&default.report_id, &name, &upgraded)
                        .await?;
                }
            }
        }
    }

    for (email, name, reports) in default_recipients() {
        store.ensure_recipient(email, Some(name)).await?;
        for report_id in reports {
            store.link_recipient_report(email, report_id).await?;
        }
    }

    reload_registry(store, registry).await
}

/// Republish the registry from stored configs. Compiled-in defaults keep
/// their registry order; operator-added reports follow in store order.
pub async fn reload_registry(store: &dyn Store, registry: &RegistryCell) -> Result<()> {
    let stored = store.stored_reports().await?;

    let mut loaded: HashMap<String, ReportConfig> = HashMap::new();
    for row in &stored {
        match ReportConfig::from_value(&row.config) {
            Ok(config) => {
                loaded.insert(row.report_id.clone(), config);
            }
            Err(err) => {
                warn!(
                    report_id = %row.report_id,
                    error = %err,
                    "config_invalid: stored config rejected, default remains in effect"
                );
            }
        }
    }

    let mut reports = Vec::new();
    for default in default_reports() {
        match loaded.remove(&default.report_id) {
            Some(config) => reports.push(config),
            None => reports.push(default),
        }
    }
    for row in &stored {
        if let Some(config) = loaded.remove(&row.report_id) {
            reports.push(config);
        }
    }

    registry.publish(reports);
    Ok(())
}
