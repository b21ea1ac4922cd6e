//! Courier subscriber fleet service.
//!
//! Main entry point. Wires the handler pool, the in-process reader fleet and
//! the reconciliation director together and coordinates graceful startup and
//! shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{RealClock, TelemetryHandler, TracingTelemetry};
use courier_dispatch::{
    queue::mock::InMemoryBroker, start_scheduler, store::mock::MemoryStateStore, EndpointRoutes,
    HostedReaders, HttpDelivery, LocalFleet, PostgresStateStore, PumpRegistry, StateStore,
};
use courier_fleet::{
    Director, DirectorHandle, JsonFileSource, ReconciliationEngine, StaticSource, SubscriberSource,
};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!("Starting Courier subscriber fleet service");
    info!(
        database_url = ?config.database_url_masked(),
        subscribers_file = %config.subscribers_file.display(),
        pool_size = config.pool_size,
        reload_interval_secs = config.reload_interval_seconds,
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    let telemetry: Arc<dyn TelemetryHandler> = Arc::new(TracingTelemetry);

    let (db_pool, store) = create_state_store(&config).await?;

    let routes = EndpointRoutes::new();
    let registry = PumpRegistry::new();
    let hosted = HostedReaders::load(&*store).await.context("Failed to load hosted readers")?;
    hosted.register_routes(&routes).await;
    let delivery = HttpDelivery::new(config.to_client_config(), routes.clone())
        .context("Failed to build HTTP delivery client")?;

    let (scheduler, scheduler_task) = start_scheduler(
        config.to_scheduler_config(),
        store.clone(),
        Arc::new(delivery),
        Arc::new(registry.clone()),
        telemetry.clone(),
        cancel.clone(),
    )
    .await
    .context("Failed to start handler pool")?;
    info!(pool = %config.pool_name, size = config.pool_size, "Handler pool started");

    warn!("No external queue backend configured, readers use the in-process broker");
    let fleet = Arc::new(LocalFleet::new(
        scheduler,
        registry,
        routes,
        Arc::new(InMemoryBroker::new()),
        store,
        telemetry.clone(),
        config.to_pump_config(),
        cancel.child_token(),
    ));
    if !hosted.is_empty() {
        let restored = fleet.restore(hosted).await;
        info!(readers = restored, "Readers from the previous run restored");
    }

    let primary: Arc<dyn SubscriberSource> =
        Arc::new(JsonFileSource::new("primary", config.subscribers_file.clone()));
    let secondary: Arc<dyn SubscriberSource> = match &config.secondary_subscribers_file {
        Some(path) => Arc::new(JsonFileSource::new("secondary", path.clone())),
        None => Arc::new(StaticSource::empty("secondary")),
    };

    let engine = ReconciliationEngine::new(
        fleet.clone(),
        Arc::new(RealClock::new()),
        config.to_retry_policy(),
        telemetry.clone(),
    );
    let (director, director_task) =
        Director::new(config.to_director_config(), primary, secondary, engine, telemetry)
            .spawn(cancel.child_token());

    let reload_task = spawn_reload_on_hangup(director.clone(), cancel.clone());

    info!("Courier is reconciling subscribers");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    director.shutdown();
    tokio::select! {
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!("Shutdown grace period expired before the director stopped");
        }
        _ = director_task => {
            info!("Director stopped");
        }
    }

    // Pumps stop without forgetting their readers; the next start restores them.
    fleet.shutdown_all().await;
    cancel.cancel();

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Handler pool task failed");
    }
    if let Some(task) = reload_task {
        let _ = task.await;
    }

    if let Some(pool) = db_pool {
        pool.close().await;
        info!("Database connections closed");
    }

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(fallback: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{fallback},courier=debug")))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Picks the durable state backend.
///
/// Postgres when `DATABASE_URL` is set, memory otherwise.
async fn create_state_store(
    config: &Config,
) -> Result<(Option<sqlx::PgPool>, Arc<dyn StateStore>)> {
    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set, unit state is kept in memory and lost on restart");
        return Ok((None, Arc::new(MemoryStateStore::new())));
    };

    let pool = create_database_pool(url, config.database_max_connections).await?;
    info!("Database connection pool established");

    let store = PostgresStateStore::new(pool.clone());
    store.migrate().await.context("Failed to create state table")?;
    info!("State table ready");

    Ok((Some(pool), Arc::new(store)))
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(url: &str, max_connections: u32) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Triggers a reconciliation pass on every SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    director: DirectorHandle,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler not installed, reload on signal disabled");
            return None;
        },
    };

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP signal, reloading subscribers");
                    match director.reload().await {
                        Ok(summary) => info!(
                            added = summary.added.len(),
                            removed = summary.removed.len(),
                            changed = summary.changed.len(),
                            failures = summary.failures,
                            "Reload finished"
                        ),
                        Err(e) => warn!(error = %e, "Reload rejected"),
                    }
                },
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _director: DirectorHandle,
    _cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    None
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
