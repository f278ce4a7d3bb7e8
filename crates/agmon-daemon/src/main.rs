//! agmon-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, connects and
//! migrates the store, reconciles the registry, starts the scheduler, and
//! serves the HTTP surface. Route handlers live in `routes.rs`; shared
//! state types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use agmon_config::Settings;
use agmon_daemon::{routes, state};
use agmon_db::{PgStore, Store};
use agmon_engine::{AlertCoordinator, Scheduler, SchedulerOptions};
use agmon_notify::{LogNotifier, Notifier};
use agmon_parse::pdf::{LopdfExtractor, PdfTextExtractor};
use agmon_registry::calendar::Clock;
use agmon_registry::RegistryCell;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars
    // directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = Settings::from_env()?;
    let pool = agmon_db::pg::connect_from_env().await?;
    agmon_db::pg::migrate(&pool).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let registry = Arc::new(RegistryCell::with_defaults());
    agmon_engine::reconcile(&*store, &registry).await?;
    info!(reports = registry.load().len(), "registry reconciled");

    // Delivery transport is pluggable behind Notifier; this build logs.
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    if settings.email_enabled {
        info!(
            sender = %settings.ses_sender,
            region = %settings.ses_region,
            "email enabled; transport adapter not wired in this build, notifications are logged"
        );
    }

    let alerts = Arc::new(AlertCoordinator::new(
        Arc::clone(&notifier),
        settings.master_alert_email.clone(),
        settings.alert_failures_threshold,
    ));
    let clock = Clock::new(settings.app_timezone);
    let extractor: Arc<dyn PdfTextExtractor> = Arc::new(LopdfExtractor);

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&notifier),
        Arc::clone(&alerts),
        Arc::clone(&extractor),
        clock,
        SchedulerOptions {
            poll_tick_seconds: settings.poll_tick_seconds,
            max_concurrency: settings.max_concurrency,
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let shared = Arc::new(state::AppState {
        pool: Some(pool),
        store,
        registry,
        notifier,
        alerts,
        extractor,
        clock,
    });

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("agmon-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("server crashed")?;

    // Stop ticking and let in-flight workers drain.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("AGMON_DAEMON_ADDR").ok()?.parse().ok()
}
