//! Carrytrack - synthetic future carry analytics for NIFTY index options.
//!
//! Tick stream in, cost-of-carry analytics out: ATM strike and expiry
//! tracking, put-call-parity synthetics, rolling calendar-spread Z-score,
//! throttled SQLite persistence, WebSocket broadcast.

use anyhow::{Context, Result};
use carrytrack_backend::{
    api::{self, AppState},
    feed::{BackoffPolicy, ConnectionMonitor, FeedHandle, FeedResilience, WsFeedTransport},
    models::Config,
    pipeline::{
        expiry::ExpirySelector, strike::StrikeSelector, tick_cache::TickCache,
        AnalyticsPipeline, Broadcaster,
    },
    storage::AnalyticsStore,
    throttle::PersistenceThrottle,
};
use clap::Parser;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, time::MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "carrytrack", about = "Synthetic future carry analytics")]
struct Args {
    /// Override the HTTP port from the environment.
    #[arg(long)]
    port: Option<u16>,
    /// Override the SQLite database path.
    #[arg(long)]
    db_path: Option<String>,
    /// Override the upstream feed WebSocket URL.
    #[arg(long)]
    feed_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.database_path = db_path;
    }
    if let Some(feed_url) = args.feed_url {
        config.feed_url = feed_url;
    }

    info!(
        feed = %config.feed_url,
        db = %config.database_path,
        "🚀 carrytrack starting"
    );

    let store = Arc::new(AnalyticsStore::new(&config.database_path)?);

    // Subscription command channel: selectors request, resilience executes.
    let (cmd_tx, cmd_rx) = mpsc::channel(1024);
    let feed_handle = FeedHandle::new(cmd_tx);

    let cache = TickCache::new();
    let monitor = Arc::new(ConnectionMonitor::new());
    let broadcaster = Arc::new(Broadcaster::new(1024));
    let strike = Arc::new(StrikeSelector::new(
        config.strike_interval,
        feed_handle.clone(),
        Some(store.clone()),
    ));
    let expiry = Arc::new(ExpirySelector::new(
        feed_handle.clone(),
        strike.clone(),
        Some(store.clone()),
    ));
    let pipeline = Arc::new(AnalyticsPipeline::new(
        cache.clone(),
        strike.clone(),
        expiry.clone(),
        broadcaster.clone(),
        monitor.clone(),
        config.max_tick_age_ms,
    ));

    // Background: tick cache GC sweep.
    let sweep_cache = cache.clone();
    let sweep_age = config.max_tick_age_ms;
    let sweep_task = tokio::spawn(interval_task(config.sweep_interval_ms, move || {
        sweep_cache.sweep(sweep_age);
    }));

    // Background: expiry rollover check (minute cadence).
    let expiry_for_task = expiry.clone();
    let expiry_task = tokio::spawn(interval_task(config.expiry_check_ms, move || {
        expiry_for_task.check_rollover(chrono::Utc::now());
    }));

    // Background: throttled persistence.
    let throttle = PersistenceThrottle::new(
        pipeline.clone(),
        store.clone(),
        config.storage_interval_ms,
        config.throttle_check_ms,
    );
    let throttle_task = tokio::spawn(throttle.run());

    // Feed supervisor: owns the connection and the backoff schedule.
    let resilience = FeedResilience::new(
        Box::new(WsFeedTransport::new(config.feed_url.clone())),
        pipeline.clone(),
        strike.clone(),
        expiry.clone(),
        monitor.clone(),
        BackoffPolicy {
            base: Duration::from_millis(config.reconnect_base_delay_ms),
            cap: Duration::from_millis(config.reconnect_max_delay_ms),
            max_attempts: config.reconnect_max_attempts,
        },
    );
    let feed_task = tokio::spawn(async move {
        if let Err(e) = resilience.run(cmd_rx).await {
            warn!(error = %e, "feed resilience worker exited");
        }
    });

    let state = AppState {
        broadcaster,
        store,
        monitor,
        strike,
        expiry,
        feed: feed_handle,
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Cancel all timers; in-flight writes finish on their own.
    info!("shutting down: cancelling background tasks");
    sweep_task.abort();
    expiry_task.abort();
    throttle_task.abort();
    feed_task.abort();

    Ok(())
}

async fn interval_task(period_ms: u64, mut f: impl FnMut() + Send + 'static) {
    let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        f();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler");
    }
}
