//! Global polling scheduler.
//!
//! A single tick loop owns all per-report scheduling state. Each tick
//! advances a due report's `next_due` *before* dispatching its worker, so a
//! long run can never be dispatched re-entrantly; worker completions flow
//! back over a channel, keeping this task the only writer of the state.
//!
//! Workers run under a global concurrency semaphore. On shutdown the loop
//! stops ticking and drains in-flight completions; in-flight HTTP calls are
//! bounded by their per-request timeouts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use rand::Rng;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use agmon_db::Store;
use agmon_notify::Notifier;
use agmon_parse::pdf::PdfTextExtractor;
use agmon_registry::calendar::{within_any_window, Clock};
use agmon_registry::{PollingRule, RegistryCell, ReportConfig};

use crate::alerts::AlertCoordinator;
use crate::worker::build_worker;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub poll_tick_seconds: u64,
    pub max_concurrency: usize,
}

/// In-memory, per-process scheduling state for one report. Not durable:
/// after a restart every report is immediately eligible.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReportSchedule {
    pub(crate) next_due: DateTime<Tz>,
    pub(crate) error_count: u32,
}

/// Seconds until the next poll of a report: window cadence, raised to the
/// capped exponential backoff while failing, plus jitter.
pub fn next_due_delay_secs(
    rule: &PollingRule,
    in_window: bool,
    error_count: u32,
    jitter: u32,
) -> u64 {
    let mut base = if in_window {
        rule.inside_cadence_sec
    } else {
        rule.outside_cadence_sec
    } as u64;
    if error_count > 0 {
        let shift = (error_count - 1).min(31);
        let exp = (rule.error_backoff_base_sec as u64).saturating_mul(1u64 << shift);
        base = (rule.error_backoff_max_sec as u64).min(base.max(exp));
    }
    base + jitter as u64
}

fn draw_jitter(jitter_sec: u32) -> u32 {
    if jitter_sec == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_sec)
    }
}

/// Check whether a report is due at `now` and, if so, advance its
/// `next_due` immediately (before any worker work begins).
pub(crate) fn due_and_advance(
    state: &mut HashMap<String, ReportSchedule>,
    config: &ReportConfig,
    now: DateTime<Tz>,
    jitter: u32,
) -> bool {
    let entry = state
        .entry(config.report_id.clone())
        .or_insert(ReportSchedule {
            next_due: now,
            error_count: 0,
        });
    if now < entry.next_due {
        return false;
    }
    let in_window = within_any_window(&config.windows, now);
    let delay = next_due_delay_secs(&config.polling, in_window, entry.error_count, jitter);
    entry.next_due = now + chrono::Duration::seconds(delay as i64);
    true
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<RegistryCell>,
    notifier: Arc<dyn Notifier>,
    alerts: Arc<AlertCoordinator>,
    extractor: Arc<dyn PdfTextExtractor>,
    clock: Clock,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<RegistryCell>,
        notifier: Arc<dyn Notifier>,
        alerts: Arc<AlertCoordinator>,
        extractor: Arc<dyn PdfTextExtractor>,
        clock: Clock,
        options: SchedulerOptions,
    ) -> Self {
        Scheduler {
            store,
            registry,
            notifier,
            alerts,
            extractor,
            clock,
            options,
        }
    }

    /// Tick until `shutdown` flips, then drain in-flight workers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, bool)>();
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.options.poll_tick_seconds,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut state: HashMap<String, ReportSchedule> = HashMap::new();
        let mut in_flight: usize = 0;

        info!(
            tick_seconds = self.options.poll_tick_seconds,
            max_concurrency = self.options.max_concurrency,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now_local();
                    let snapshot = self.registry.load();
                    for config in snapshot.reports() {
                        let jitter = draw_jitter(config.polling.jitter_sec);
                        if due_and_advance(&mut state, config, now, jitter) {
                            in_flight += 1;
                            self.dispatch(Arc::clone(config), &semaphore, &done_tx);
                        }
                    }
                }
                Some((report_id, success)) = done_rx.recv() => {
                    in_flight = in_flight.saturating_sub(1);
                    if let Some(entry) = state.get_mut(&report_id) {
                        if success {
                            entry.error_count = 0;
                        } else {
                            entry.error_count += 1;
                            warn!(
                                %report_id,
                                error_count = entry.error_count,
                                "worker reported failure"
                            );
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(in_flight, "scheduler stopping, draining workers");
        drop(done_tx);
        while in_flight > 0 {
            match done_rx.recv().await {
                Some(_) => in_flight -= 1,
                None => break,
            }
        }
        info!("scheduler stopped");
    }

    fn dispatch(
        &self,
        config: Arc<ReportConfig>,
        semaphore: &Arc<Semaphore>,
        done_tx: &mpsc::UnboundedSender<(String, bool)>,
    ) {
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let alerts = Arc::clone(&self.alerts);
        let extractor = Arc::clone(&self.extractor);
        let clock = self.clock;
        let semaphore = Arc::clone(semaphore);
        let done_tx = done_tx.clone();

        tokio::spawn(async move {
            let report_id = config.report_id.clone();
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = done_tx.send((report_id, true));
                    return;
                }
            };
            let worker = build_worker(config, clock, extractor);
            let success = worker
                .run(store.as_ref(), notifier.as_ref(), alerts.as_ref())
                .await;
            if done_tx.send((report_id.clone(), success)).is_err() {
                error!(%report_id, "scheduler gone before worker completion");
            }
        });
    }
}
