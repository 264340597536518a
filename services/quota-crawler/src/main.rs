//! Quota-aware API crawler
//!
//! Single-binary service that:
//! 1. Loads the credential pool from the durable quota ledger
//! 2. Imports new API keys from the keys file
//! 3. Serves the admin API (health, metrics, credential and task management)
//! 4. Crawls keywords with a pool of workers, one upstream call per plan step
//!
//! With `--keywords PATH` it runs a batch and exits when the queue drains;
//! otherwise it runs until SIGINT/SIGTERM, fed through `POST /admin/tasks`.

mod admin;
mod config;
mod error;
mod input;
mod metrics;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use credential_pool::Pool;
use dispatcher::{Dispatcher, RateLimitedClient};
use quota_ledger::FileLedger;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{Instrument, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{HeaderInjection, HttpUpstream, QueryParam};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::sink::JsonlSink;

/// Command line arguments.
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<String>,
    keywords: Option<PathBuf>,
}

impl Args {
    fn parse(args: &[String]) -> Self {
        let value_of = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        Self {
            config: value_of("--config"),
            keywords: value_of("--keywords").map(PathBuf::from),
        }
    }
}

/// Build the HTTP upstream from config.
fn build_upstream(config: &Config) -> Result<HttpUpstream> {
    let client = reqwest::Client::builder()
        .timeout(config.call_timeout())
        .build()
        .context("failed to build HTTP client")?;
    let upstream = &config.upstream;
    Ok(HttpUpstream::new(
        client,
        upstream.base_url.clone(),
        upstream.paths.clone(),
        upstream.task_param.clone(),
        upstream.key_param.clone(),
        upstream
            .params
            .iter()
            .map(|p| QueryParam {
                name: p.name.clone(),
                value: p.value.clone(),
            })
            .collect(),
        upstream
            .headers
            .iter()
            .map(|h| HeaderInjection {
                name: h.name.clone(),
                value: h.value.clone(),
            })
            .collect(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting quota-crawler");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let raw_args: Vec<String> = std::env::args().collect();
    let args = Args::parse(&raw_args);

    let config_path = Config::resolve_path(args.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        ledger = %config.ledger.path.display(),
        base_url = %config.upstream.base_url,
        parallelism = config.dispatcher.parallelism,
        plan = ?config.dispatcher.plan,
        admin_addr = %config.admin.listen_addr,
        "configuration loaded"
    );

    // --- Pool ---
    let ledger = FileLedger::open(config.ledger.path.clone())
        .await
        .with_context(|| format!("failed to open ledger {}", config.ledger.path.display()))?;
    let pool = Arc::new(
        Pool::load(Arc::new(ledger))
            .await
            .context("failed to load credential pool")?,
    );

    if let Some(keys_file) = &config.credentials.keys_file {
        input::import_keys(&pool, keys_file, config.credentials.default_quota)
            .await
            .context("failed to import API keys")?;
    }
    if pool.counts().await.total == 0 {
        warn!("credential pool is empty, add keys via POST /admin/credentials");
    }

    let flush_task = credential_pool::spawn_flush_task(
        pool.clone(),
        Duration::from_secs(config.ledger.flush_interval_secs),
    );

    // --- Dispatcher ---
    let upstream = Arc::new(build_upstream(&config)?);
    let client = Arc::new(RateLimitedClient::new(
        pool.clone(),
        upstream,
        config.cost_table(),
        config.call_timeout(),
    ));
    let sink = JsonlSink::open(&config.output.results_path).await?;
    info!(path = %sink.path().display(), "writing results");
    let dispatcher = Arc::new(
        Dispatcher::new(
            client,
            config.retry_policy(),
            Arc::new(sink),
            config.dispatcher_config(),
        )
        .context("invalid dispatcher settings")?,
    );

    // --- Admin API ---
    let admin_state = AdminState::new(
        pool.clone(),
        dispatcher.clone(),
        prometheus_handle,
        config.credentials.default_quota,
    );
    let app = build_admin_router(admin_state, config.admin.max_connections);
    let listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.admin.listen_addr))?;
    info!(addr = %config.admin.listen_addr, "admin API listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
        })
    };

    // --- Input ---
    if let Some(path) = &args.keywords {
        let keywords = input::read_lines(path).await?;
        let mut accepted = 0usize;
        for keyword in keywords {
            if dispatcher.enqueue(keyword).await {
                accepted += 1;
            }
        }
        dispatcher.close().await;
        info!(path = %path.display(), accepted, "batch mode: keywords queued");
    } else {
        info!("daemon mode: waiting for tasks via POST /admin/tasks");
    }

    // Signals stop the dispatcher; the dispatcher finishing stops the server.
    let signal_task = {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_tx.send_replace(true);
        })
    };

    let run_id = uuid::Uuid::new_v4().as_simple().to_string();
    let outcome = dispatcher
        .clone()
        .run(shutdown_rx)
        .instrument(tracing::info_span!("run", run_id = %run_id))
        .await;

    shutdown_tx.send_replace(true);
    signal_task.abort();
    flush_task.abort();

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "admin server error during shutdown"),
        Err(e) => error!(error = %e, "admin server task panicked"),
    }

    flush_at_exit(&pool).await;

    let summary = outcome.context("dispatcher stopped")?;
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        pending = summary.pending,
        worker_panics = summary.worker_panics,
        "shutdown complete"
    );
    Ok(())
}

/// Push out admin changes made while the server drained.
///
/// Returns how many operations are still buffered.
async fn flush_at_exit(pool: &Pool) -> usize {
    if let Err(e) = pool.flush().await {
        warn!(error = %e, "final ledger flush failed");
    }
    let pending = pool.pending_ops().await;
    if pending > 0 {
        warn!(pending, "ledger operations still buffered at exit");
    }
    pending
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
