//! Upstream connection lifecycle.
//!
//! Disconnected -> Connecting -> Live -> (drop) Reconnecting -> Live | Failed.
//! Backoff doubles from a base delay up to a cap; exhausting the attempt
//! budget parks the worker in Failed until a force-reconnect command arrives.
//! Every successful (re)connect replays the selectors' *current* instrument
//! sets, because a reconnect without resubscription silently starves the
//! whole pipeline.

use crate::feed::transport::{FeedCommand, FeedConnection, FeedTransport};
use crate::instruments::SPOT_INSTRUMENT;
use crate::models::ConnectionStatus;
use crate::pipeline::expiry::ExpirySelector;
use crate::pipeline::strike::StrikeSelector;
use crate::pipeline::AnalyticsPipeline;
use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Observable connection state: a readable cell for snapshot tagging plus a
/// broadcast channel for transition listeners.
pub struct ConnectionMonitor {
    status: RwLock<ConnectionStatus>,
    tx: broadcast::Sender<ConnectionStatus>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            status: RwLock::new(ConnectionStatus::Disconnected),
            tx,
        }
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn set(&self, status: ConnectionStatus) {
        let changed = {
            let mut guard = self.status.write();
            let changed = *guard != status;
            *guard = status;
            changed
        };
        if changed {
            info!(status = status.as_str(), "🔌 feed connection status");
            let _ = self.tx.send(status);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }
}

pub struct FeedResilience {
    transport: Box<dyn FeedTransport>,
    pipeline: Arc<AnalyticsPipeline>,
    strike: Arc<StrikeSelector>,
    expiry: Arc<ExpirySelector>,
    monitor: Arc<ConnectionMonitor>,
    backoff: BackoffPolicy,
}

enum StreamExit {
    Closed,
    ForceReconnect,
    CommandsGone,
}

impl FeedResilience {
    pub fn new(
        transport: Box<dyn FeedTransport>,
        pipeline: Arc<AnalyticsPipeline>,
        strike: Arc<StrikeSelector>,
        expiry: Arc<ExpirySelector>,
        monitor: Arc<ConnectionMonitor>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            pipeline,
            strike,
            expiry,
            monitor,
            backoff,
        }
    }

    pub async fn run(self, mut cmd_rx: mpsc::Receiver<FeedCommand>) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            self.monitor.set(if attempt == 0 {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            });

            match self.transport.connect().await {
                Ok(mut conn) => {
                    attempt = 0;
                    // A failed subscribe call is not a dead connection: log
                    // it and stream anyway. The next reconnect replay retries
                    // the set, and a genuinely broken socket surfaces as a
                    // stream error below.
                    if let Err(e) = self.replay_subscriptions(conn.as_mut()).await {
                        warn!(error = %e, "subscription replay failed; retried on next reconnect");
                    }
                    self.monitor.set(ConnectionStatus::Live);
                    match self.stream(conn.as_mut(), &mut cmd_rx).await {
                        Ok(StreamExit::Closed) => {
                            warn!("feed stream closed; reconnecting");
                        }
                        Ok(StreamExit::ForceReconnect) => {
                            info!("force-reconnect requested; cycling connection");
                        }
                        Ok(StreamExit::CommandsGone) => {
                            // Shutdown path: every handle dropped.
                            self.monitor.set(ConnectionStatus::Disconnected);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(error = %e, "feed stream error; reconnecting");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "feed connect failed");
                }
            }

            attempt += 1;
            if attempt > self.backoff.max_attempts {
                self.monitor.set(ConnectionStatus::Failed);
                error!(
                    attempts = attempt - 1,
                    "feed connection failed permanently; waiting for force-reconnect"
                );
                loop {
                    match cmd_rx.recv().await {
                        Some(FeedCommand::ForceReconnect) => {
                            attempt = 0;
                            break;
                        }
                        Some(cmd) => {
                            debug!(?cmd, "dropping command while in failed state");
                        }
                        None => {
                            return Ok(());
                        }
                    }
                }
                continue;
            }

            let delay = self.backoff.delay(attempt);
            info!(attempt, ?delay, "⏳ reconnect backoff");
            tokio::time::sleep(delay).await;
        }
    }

    /// Re-arm the feed with the selectors' current view. The expiry check
    /// runs first so legs reflect any rollover that happened while offline;
    /// leg ids are tenor-coded, so the strike selector's set is the full one.
    async fn replay_subscriptions(&self, conn: &mut dyn FeedConnection) -> Result<()> {
        let _ = self.expiry.check_rollover(Utc::now());

        let mut instruments = vec![SPOT_INSTRUMENT.to_string()];
        instruments.extend(self.strike.current_instruments());
        info!(count = instruments.len(), "re-subscribing current instrument set");
        conn.subscribe(&instruments).await
    }

    async fn stream(
        &self,
        conn: &mut dyn FeedConnection,
        cmd_rx: &mut mpsc::Receiver<FeedCommand>,
    ) -> Result<StreamExit> {
        enum Event {
            Tick(Option<crate::models::Tick>),
            Cmd(Option<FeedCommand>),
        }

        loop {
            let event = tokio::select! {
                tick = conn.next_tick() => Event::Tick(tick?),
                cmd = cmd_rx.recv() => Event::Cmd(cmd),
            };

            match event {
                Event::Tick(Some(tick)) => {
                    self.pipeline.on_tick(tick);
                }
                Event::Tick(None) => {
                    return Ok(StreamExit::Closed);
                }
                Event::Cmd(Some(FeedCommand::Subscribe(instruments))) => {
                    if let Err(e) = conn.subscribe(&instruments).await {
                        // Local selector state has already advanced; the next
                        // reconnect replay retries the subscription.
                        warn!(error = %e, ?instruments, "subscribe call failed");
                    }
                }
                Event::Cmd(Some(FeedCommand::Unsubscribe(instruments))) => {
                    if let Err(e) = conn.unsubscribe(&instruments).await {
                        warn!(error = %e, ?instruments, "unsubscribe call failed");
                    }
                }
                Event::Cmd(Some(FeedCommand::ForceReconnect)) => {
                    return Ok(StreamExit::ForceReconnect);
                }
                Event::Cmd(None) => {
                    return Ok(StreamExit::CommandsGone);
                }
            }
        }
    }
}
