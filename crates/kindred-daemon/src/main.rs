//! kindred daemon: submission ingestion and plagiarism analysis service.
//!
//! Runs three long-lived pieces on one Tokio runtime:
//! - the stream consumer (with its retention trimmer),
//! - the HTTP surface (`/health`, `/metrics`, `/api/v1/compute`),
//! - housekeeping sweeps for the status ledger and the rate limiter.
//!
//! SIGTERM/SIGINT cancel a process-wide token; every task drains and the
//! server shuts down gracefully.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kindred_core::aggregate::Aggregator;
use kindred_core::preprocess::{HttpPreprocessor, PreprocessService};
use kindred_core::retry::RetryEngine;
use kindred_core::status::MemoryStatusLedger;
use kindred_core::store::SqliteStore;
use kindred_core::stream::{
    default_consumer_name, Consumer, ConsumerConfig, SqliteStreamBackend,
};
use kindred_core::WorkerPool;
use kindred_daemon::config::Config;
use kindred_daemon::http::rate_limit::{RateLimitConfig, RateLimiter};
use kindred_daemon::http::{router, AppState};
use kindred_daemon::metrics::Metrics;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How often expired status-ledger and rate-limiter entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// kindred daemon - plagiarism analysis service
#[derive(Parser, Debug)]
#[command(name = "kindred-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Data directory override (defaults to DATA_DIR or ./kindred-data)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Listen port override (defaults to SERVER_PORT or 8080)
    #[arg(long)]
    port: Option<u16>,

    /// Log filter override (defaults to LOG_LEVEL or info)
    #[arg(long)]
    log_level: Option<String>,

    /// Disable the stream consumer (compute-only instance)
    #[arg(long)]
    no_consumer: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    config.validate().context("invalid configuration")?;

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting kindred daemon");

    std::fs::create_dir_all(&config.data_dir).context("failed to create data directory")?;

    // Storage.
    let store = Arc::new(
        SqliteStore::open(config.analysis_db_path()).context("failed to open analysis store")?,
    );
    let stream = Arc::new(
        SqliteStreamBackend::open(config.stream_db_path())
            .context("failed to open stream store")?,
    );
    let status = Arc::new(MemoryStatusLedger::new());
    let metrics = Arc::new(Metrics::new().context("failed to initialize metrics")?);

    // Process-wide shutdown token; children drive every long-lived task.
    let shutdown = CancellationToken::new();

    // Analysis pool and orchestrator.
    let pool = Arc::new(WorkerPool::new(shutdown.child_token()));
    let aggregator = Arc::new(Aggregator::new(
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
        Arc::clone(&status) as _,
        Arc::clone(&pool),
        config.batch_size,
    ));

    // Ingestion.
    let consumer_task = if args.no_consumer {
        info!("stream consumer disabled (--no-consumer)");
        None
    } else {
        let preprocessor = Arc::new(HttpPreprocessor::new(
            config.preprocessor_base_url.clone(),
            config.preprocessor_api_key.clone(),
        ));
        let service = Arc::new(PreprocessService::new(
            preprocessor,
            Arc::clone(&store) as _,
        ));
        let retry = RetryEngine::new(Arc::clone(&stream) as _);

        let consumer_name = default_consumer_name();
        info!(consumer = consumer_name, "stream consumer initialized");
        let consumer = Consumer::new(
            Arc::clone(&stream) as _,
            service,
            retry,
            Arc::clone(&status) as _,
            ConsumerConfig::new(
                config.stream_name.clone(),
                config.consumer_group.clone(),
                consumer_name,
                config.stream_retention,
            ),
        )
        .with_observer(Arc::clone(&metrics) as _);

        let consumer_cancel = shutdown.child_token();
        Some(tokio::spawn(async move {
            if let Err(error) = consumer.run(consumer_cancel).await {
                error!(%error, "stream consumer exited with error");
            }
        }))
    };

    // HTTP surface.
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::from_rps(
        config.rate_limit_rps,
    )));
    let state = AppState {
        artifacts: Arc::clone(&store) as _,
        results: Arc::clone(&store) as _,
        status: Arc::clone(&status) as _,
        aggregator,
        compute_sem: Arc::new(Semaphore::new(config.max_concurrent_compute)),
        computation_timeout: config.computation_timeout,
        api_secret: Arc::new(config.api_secret.clone()),
        rate_limiter: Arc::clone(&rate_limiter),
        metrics: Arc::clone(&metrics),
        shutdown: shutdown.clone(),
    };
    let app = router(state);

    // Housekeeping: one periodic sweep task for both expiring tables.
    let sweep_status = Arc::clone(&status);
    let sweep_limiter = Arc::clone(&rate_limiter);
    let sweep_cancel = shutdown.child_token();
    let sweeper = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = sweep_cancel.cancelled() => return,
                () = tokio::time::sleep(SWEEP_INTERVAL) => {
                    let expired = sweep_status.sweep();
                    let stale = sweep_limiter.sweep();
                    if expired > 0 || stale > 0 {
                        tracing::debug!(expired, stale, "swept expired entries");
                    }
                }
            }
        }
    });

    // Signal handling.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let sigterm = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                },
                Err(error) => {
                    error!(%error, "failed to register SIGTERM handler");
                    std::future::pending::<()>().await;
                },
            }
        };
        let sigint = async {
            match signal(SignalKind::interrupt()) {
                Ok(mut stream) => {
                    stream.recv().await;
                },
                Err(error) => {
                    error!(%error, "failed to register SIGINT handler");
                    std::future::pending::<()>().await;
                },
            }
        };

        tokio::select! {
            () = sigterm => info!("received SIGTERM"),
            () = sigint => info!("received SIGINT"),
        }
        signal_shutdown.cancel();
    });

    // Serve until shutdown.
    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server port")?;
    info!(%addr, "HTTP server listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
    .await
    .context("server error")?;

    // Drain.
    info!("shutting down");
    shutdown.cancel();
    if let Some(task) = consumer_task {
        if let Err(error) = task.await {
            warn!(%error, "consumer task join failed");
        }
    }
    let _ = sweeper.await;
    pool.close().await;

    info!("shutdown complete");
    Ok(())
}
