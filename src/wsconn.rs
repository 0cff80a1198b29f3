// =============================================================================
// WebSocket Connection — upstream link with reconnect supervision
// =============================================================================
//
// State machine: disconnected → connecting → connected → {disconnected,
// reconnecting} → connecting. The owner receives a notification for every
// transition and every incoming frame through its mailbox.
//
// Reconnect delay is `min(base * factor^attempt, max)`; the attempt counter
// increments on each failure and resets to zero after a successful upgrade.
// `send` fails fast with `not_connected` unless the link is up. Dropping the
// owner's receiver terminates the connection task.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message};
use tracing::{debug, info, warn};

use crate::error::WsError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for WsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Notification delivered to the owner's mailbox.
#[derive(Debug, Clone)]
pub enum WsNotice {
    StateChanged { state: WsState, attempt: u32 },
    TextFrame(String),
    BinaryFrame(Vec<u8>),
    ConnectFailed { error: WsError, attempt: u32 },
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owner-facing handle for a supervised WebSocket connection.
#[derive(Clone)]
pub struct WsHandle {
    state: Arc<RwLock<WsState>>,
    out_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl WsHandle {
    pub fn state(&self) -> WsState {
        *self.state.read()
    }

    /// Queue a text frame for sending. Fails fast when the link is down.
    pub fn send(&self, text: impl Into<String>) -> Result<(), WsError> {
        if self.state() != WsState::Connected {
            return Err(WsError::NotConnected);
        }
        self.out_tx
            .try_send(text.into())
            .map_err(|e| WsError::Network(format!("outbound queue: {e}")))
    }

    /// Terminate the connection task and mark the link disconnected.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Spawn the connection task for `url`, delivering notices to `owner_tx`.
pub fn connect(
    url: impl Into<String>,
    owner_tx: mpsc::Sender<WsNotice>,
    policy: ReconnectPolicy,
) -> WsHandle {
    let url = url.into();
    let state = Arc::new(RwLock::new(WsState::Disconnected));
    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = WsHandle {
        state: Arc::clone(&state),
        out_tx,
        shutdown_tx,
    };

    tokio::spawn(run_connection(url, state, owner_tx, out_rx, shutdown_rx, policy));
    handle
}

async fn set_state(
    state: &Arc<RwLock<WsState>>,
    owner_tx: &mpsc::Sender<WsNotice>,
    next: WsState,
    attempt: u32,
) -> bool {
    *state.write() = next;
    owner_tx
        .send(WsNotice::StateChanged { state: next, attempt })
        .await
        .is_ok()
}

fn classify(err: &TungsteniteError) -> WsError {
    match err {
        TungsteniteError::Http(resp) => WsError::UpgradeFailed {
            status: resp.status().as_u16(),
        },
        other => WsError::Network(other.to_string()),
    }
}

async fn run_connection(
    url: String,
    state: Arc<RwLock<WsState>>,
    owner_tx: mpsc::Sender<WsNotice>,
    mut out_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    policy: ReconnectPolicy,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if !set_state(&state, &owner_tx, WsState::Connecting, attempt).await {
            return;
        }

        let connected = tokio::select! {
            result = connect_async(&url) => result,
            _ = shutdown_rx.changed() => break,
        };

        match connected {
            Ok((stream, _response)) => {
                attempt = 0;
                info!(url = %url, "websocket connected");
                if !set_state(&state, &owner_tx, WsState::Connected, attempt).await {
                    return;
                }

                let (mut write, mut read) = stream.split();
                let dropped = loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            let _ = write.send(Message::Close(None)).await;
                            break false;
                        }
                        outbound = out_rx.recv() => {
                            match outbound {
                                Some(text) => {
                                    if let Err(e) = write.send(Message::Text(text.into())).await {
                                        warn!(url = %url, error = %e, "websocket send failed");
                                        break true;
                                    }
                                }
                                None => break false,
                            }
                        }
                        incoming = read.next() => {
                            match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    if owner_tx.send(WsNotice::TextFrame(text.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Binary(data))) => {
                                    if owner_tx.send(WsNotice::BinaryFrame(data.to_vec())).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Close(frame))) => {
                                    debug!(url = %url, frame = ?frame, "websocket close frame");
                                    break true;
                                }
                                // Ping/Pong are answered by tungstenite itself.
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(url = %url, error = %e, "websocket read error");
                                    break true;
                                }
                                None => {
                                    debug!(url = %url, "websocket stream ended");
                                    break true;
                                }
                            }
                        }
                    }
                };

                if !dropped {
                    // Owner-initiated shutdown.
                    break;
                }

                if !set_state(&state, &owner_tx, WsState::Reconnecting, attempt).await {
                    return;
                }
            }
            Err(e) => {
                let error = classify(&e);
                warn!(url = %url, error = %error, attempt, "websocket connect failed");
                if owner_tx
                    .send(WsNotice::ConnectFailed {
                        error,
                        attempt,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                if !set_state(&state, &owner_tx, WsState::Reconnecting, attempt).await {
                    return;
                }
            }
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(url = %url, delay_ms = delay.as_millis() as u64, attempt, "reconnect backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    let _ = set_state(&state, &owner_tx, WsState::Disconnected, attempt).await;
    info!(url = %url, "websocket connection closed");
}
