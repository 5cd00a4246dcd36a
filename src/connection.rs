//! Connection manager for the responder channel.
//!
//! Owns the single logical WebSocket connection to the remote responder. A
//! background task connects, relays messages in both directions, and on any
//! closure sleeps a fixed delay and reconnects — indefinitely. Messages sent
//! while the channel is not open are dropped, not queued: user input is
//! at-most-once, never retried.

use crate::config::ConnectionConfig;
use crate::error::{Result, SessionError};
use crate::protocol::{InboundMessage, OutboundMessage};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Observable state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// What the session controller needs from the responder channel.
///
/// The controller never touches transport state directly; it only gates
/// sends on openness and fires messages.
pub trait ResponderLink: Send {
    fn is_open(&self) -> bool;

    /// Transmit a message. Returns `false` when it was dropped.
    fn send(&self, msg: &OutboundMessage) -> bool;

    /// Tear the channel down and stop reconnecting.
    fn shutdown(&self);
}

/// Handle to the background connection task.
///
/// Exactly one connection is live per manager; dropping the manager (or
/// calling [`ConnectionManager::shutdown`]) tears the connection down before
/// another may be opened.
pub struct ConnectionManager {
    outbound_tx: mpsc::UnboundedSender<String>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Spawn the connection task. Inbound messages arrive on the returned
    /// receiver in arrival order.
    ///
    /// A malformed or non-WebSocket url in the config is rejected up front,
    /// before the retry loop can spin on it.
    pub fn connect(
        config: &ConnectionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>)> {
        let url = Url::parse(&config.url)
            .map_err(|e| SessionError::Connection(format!("invalid url {:?}: {e}", config.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SessionError::Connection(format!(
                "unsupported url scheme {:?}",
                url.scheme()
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let url = url.to_string();
        let delay = Duration::from_millis(config.reconnect_delay_ms);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            connection_loop(url, delay, state_tx, inbound_tx, outbound_rx, task_cancel).await;
        });

        Ok((
            Self {
                outbound_tx,
                state_rx,
                cancel,
            },
            inbound_rx,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch channel for state transitions (for gating sends and UI).
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Transmit a message. Returns `false` when the channel is not open —
    /// the message is dropped, not queued.
    pub fn send(&self, msg: &OutboundMessage) -> bool {
        if !self.is_open() {
            debug!("dropping outbound message: connection not open");
            return false;
        }
        match serde_json::to_string(msg) {
            Ok(json) => self.outbound_tx.send(json).is_ok(),
            Err(e) => {
                warn!("cannot serialize outbound message: {e}");
                false
            }
        }
    }

    /// Tear down the connection and stop reconnecting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl ResponderLink for ConnectionManager {
    fn is_open(&self) -> bool {
        ConnectionManager::is_open(self)
    }

    fn send(&self, msg: &OutboundMessage) -> bool {
        ConnectionManager::send(self, msg)
    }

    fn shutdown(&self) {
        ConnectionManager::shutdown(self);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run the connection with unconditional fixed-delay reconnection.
///
/// There is no backoff growth and no retry cap: the session is long-lived
/// and interactive, so the loop keeps trying until cancelled.
async fn connection_loop(
    url: String,
    delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let _ = state_tx.send(ConnectionState::Connecting);

        let result = tokio::select! {
            r = try_connect(&url, &state_tx, &inbound_tx, &mut outbound_rx) => r,
            _ = cancel.cancelled() => {
                let _ = state_tx.send(ConnectionState::Closed);
                return;
            }
        };

        let _ = state_tx.send(ConnectionState::Closed);
        match result {
            Ok(()) => warn!("responder closed the connection"),
            Err(e) => warn!("connection failed: {e}"),
        }

        // Fixed-delay retry; anything sent meanwhile is dropped, not queued.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                _ = cancel.cancelled() => return,
                Some(_) = outbound_rx.recv() => {
                    debug!("dropping message sent while disconnected");
                }
            }
        }
    }
}

/// Run a single connection until it closes. `Ok(())` means the responder
/// closed cleanly; `Err` is a connect failure or transport error.
async fn try_connect(
    url: &str,
    state_tx: &watch::Sender<ConnectionState>,
    inbound_tx: &mpsc::UnboundedSender<InboundMessage>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| SessionError::Connection(format!("connect: {e}")))?;
    info!("connected to responder at {url}");

    let (mut write, mut read) = ws_stream.split();
    let _ = state_tx.send(ConnectionState::Open);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(inbound) => {
                                if inbound_tx.send(inbound).is_err() {
                                    // Receiver gone — session is shutting down.
                                    return Ok(());
                                }
                            }
                            Err(e) => debug!("ignoring unparseable inbound message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    None => {
                        return Err(SessionError::Connection(
                            "connection closed unexpectedly".into(),
                        ));
                    }
                    Some(Err(e)) => {
                        return Err(SessionError::Connection(format!("read error: {e}")));
                    }
                    _ => {} // Binary and ping/pong frames handled by tungstenite.
                }
            }
            Some(json) = outbound_rx.recv() => {
                if let Err(e) = write.send(Message::Text(json)).await {
                    return Err(SessionError::Connection(format!("send error: {e}")));
                }
            }
        }
    }
}
