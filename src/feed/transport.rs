//! Upstream feed transport boundary.
//!
//! The broker connection is an external collaborator: all this process needs
//! is a stream of tick events and a subscribe/unsubscribe call that succeeds
//! or fails per invocation. `FeedTransport`/`FeedConnection` capture exactly
//! that seam; the production implementation speaks JSON over a WebSocket.

use crate::models::Tick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Subscription management requests, issued by the strike/expiry selectors
/// and by the resilience worker's replay. Non-blocking at the call site.
#[derive(Debug, Clone)]
pub enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Manual escape hatch out of the terminal Failed state.
    ForceReconnect,
}

/// Cheap cloneable handle for requesting subscription changes without
/// touching the live connection directly.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    cmd_tx: mpsc::Sender<FeedCommand>,
}

impl FeedHandle {
    pub fn new(cmd_tx: mpsc::Sender<FeedCommand>) -> Self {
        Self { cmd_tx }
    }

    pub fn subscribe(&self, instruments: Vec<String>) {
        if instruments.is_empty() {
            return;
        }
        if let Err(e) = self.cmd_tx.try_send(FeedCommand::Subscribe(instruments)) {
            warn!(error = %e, "failed to queue subscribe request");
        }
    }

    pub fn unsubscribe(&self, instruments: Vec<String>) {
        if instruments.is_empty() {
            return;
        }
        if let Err(e) = self.cmd_tx.try_send(FeedCommand::Unsubscribe(instruments)) {
            warn!(error = %e, "failed to queue unsubscribe request");
        }
    }

    pub fn force_reconnect(&self) {
        if let Err(e) = self.cmd_tx.try_send(FeedCommand::ForceReconnect) {
            warn!(error = %e, "failed to queue force-reconnect request");
        }
    }
}

#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>>;
}

#[async_trait]
pub trait FeedConnection: Send {
    /// Next tick from the feed. `Ok(None)` means the peer closed cleanly;
    /// `Err` means the connection dropped.
    async fn next_tick(&mut self) -> Result<Option<Tick>>;

    async fn subscribe(&mut self, instruments: &[String]) -> Result<()>;

    async fn unsubscribe(&mut self, instruments: &[String]) -> Result<()>;
}

/// Production transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsFeedTransport {
    url: String,
}

impl WsFeedTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>> {
        let (ws_stream, resp) = connect_async(&self.url)
            .await
            .with_context(|| format!("connect_async {}", self.url))?;
        debug!(status = %resp.status(), "feed ws connected");

        let (write, read) = ws_stream.split();
        let mut ping = interval(Duration::from_secs(5));
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Box::new(WsFeedConnection { write, read, ping }))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct WsFeedConnection {
    write: WsSink,
    read: WsSource,
    ping: Interval,
}

impl WsFeedConnection {
    async fn send_instrument_frame(&mut self, action: &str, instruments: &[String]) -> Result<()> {
        let frame = serde_json::json!({
            "action": action,
            "instruments": instruments,
        });
        self.write
            .send(Message::Text(frame.to_string()))
            .await
            .with_context(|| format!("send {action} frame"))
    }
}

#[async_trait]
impl FeedConnection for WsFeedConnection {
    async fn next_tick(&mut self) -> Result<Option<Tick>> {
        loop {
            tokio::select! {
                _ = self.ping.tick() => {
                    let _ = self.write.send(Message::Ping(Vec::new())).await;
                }
                msg = self.read.next() => {
                    let Some(msg) = msg else {
                        return Ok(None);
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Some(tick) = parse_tick_frame(&text) {
                                return Ok(Some(tick));
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = self.write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "feed ws close frame");
                            return Ok(None);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("feed ws error: {e}"));
                        }
                    }
                }
            }
        }
    }

    async fn subscribe(&mut self, instruments: &[String]) -> Result<()> {
        self.send_instrument_frame("subscribe", instruments).await
    }

    async fn unsubscribe(&mut self, instruments: &[String]) -> Result<()> {
        self.send_instrument_frame("unsubscribe", instruments).await
    }
}

fn parse_tick_frame(text: &str) -> Option<Tick> {
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    if json.get("type").and_then(|v| v.as_str()) != Some("tick") {
        return None;
    }
    match serde_json::from_value::<Tick>(json) {
        Ok(tick) => Some(tick),
        Err(e) => {
            debug!(error = %e, "failed to parse tick frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tick_frame() {
        let frame = r#"{
            "type": "tick",
            "instrument_id": "NIFTY_SPOT",
            "last_price": 21412.5,
            "volume": 1200.0,
            "observed_at_ms": 1700000000000
        }"#;
        let tick = parse_tick_frame(frame).expect("tick should parse");
        assert_eq!(tick.instrument_id, "NIFTY_SPOT");
        assert_eq!(tick.last_price, 21_412.5);
        assert!(tick.bid.is_none());
    }

    #[test]
    fn ignores_non_tick_frames() {
        assert!(parse_tick_frame(r#"{"type":"heartbeat"}"#).is_none());
        assert!(parse_tick_frame("not json").is_none());
        assert!(parse_tick_frame(r#"{"type":"tick","instrument_id":1}"#).is_none());
    }
}
