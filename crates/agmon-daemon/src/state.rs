//! Shared runtime state for agmon-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum; everything inside is
//! already `Arc`-shared with the scheduler, so handler-triggered runs use
//! the same store, notifier, and alert coordinator as scheduled ones.

use std::sync::Arc;

use sqlx::PgPool;

use agmon_db::Store;
use agmon_engine::AlertCoordinator;
use agmon_notify::Notifier;
use agmon_parse::pdf::PdfTextExtractor;
use agmon_registry::calendar::Clock;
use agmon_registry::RegistryCell;

pub struct AppState {
    /// Pool handle used only for the health-check ping; all persistence
    /// goes through `store`.
    pub pool: Option<PgPool>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<RegistryCell>,
    pub notifier: Arc<dyn Notifier>,
    pub alerts: Arc<AlertCoordinator>,
    pub extractor: Arc<dyn PdfTextExtractor>,
    pub clock: Clock,
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
