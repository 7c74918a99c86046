//! Realtime link to the server.
//!
//! Owns one WebSocket session at a time: dials the `/realtime` endpoint,
//! pumps frames in both directions, and supervises reconnection with the
//! configured backoff when the link drops. Consumers observe the link
//! through two broadcast streams: decoded [`ServerEvent`]s and
//! [`ConnectionEvent`] lifecycle transitions.

use std::sync::{Arc, Mutex, MutexGuard};

use chatwire_common::error::{AppError, AppResult};
use chatwire_common::events::{ClientEvent, ServerEvent};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::reconnect::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 1024;
const LIFECYCLE_CAPACITY: usize = 64;

/// Lifecycle transitions of the realtime link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A link was established by an explicit [`Transport::connect`].
    Established,
    /// The link dropped; automatic reconnection is starting.
    Lost {
        /// Human-readable cause of the drop.
        reason: String,
    },
    /// A reconnection attempt failed. More attempts may follow before the
    /// link either comes back or gives up.
    Error {
        /// Human-readable cause of the failure.
        reason: String,
    },
    /// The link came back after the given number of attempts.
    Reconnected {
        /// 1-indexed attempt that succeeded.
        attempt: u32,
    },
    /// Every reconnection attempt was exhausted; the link stays down.
    Failed,
    /// The server declared the session credential expired. Terminal: no
    /// reconnection is attempted, since redialing with the same token
    /// would only be rejected again. A caller holding a fresh credential
    /// resumes with [`Transport::connect_with_token`].
    TokenExpired,
}

enum PumpExit {
    Lost(String),
    TokenExpired,
    Superseded,
}

enum Reestablish {
    Connected { socket: WsStream, attempt: u32 },
    GaveUp,
    Superseded,
}

#[derive(Default)]
struct LinkState {
    token: String,
    outbound: Option<mpsc::UnboundedSender<ClientEvent>>,
    connected: bool,
}

struct TransportInner {
    server_url: String,
    policy: ReconnectPolicy,
    state: Mutex<LinkState>,
    /// Bumped by every `connect`/`disconnect`; a running driver exits as
    /// soon as its captured generation falls behind.
    generation: watch::Sender<u64>,
    lifecycle: broadcast::Sender<ConnectionEvent>,
    events: broadcast::Sender<ServerEvent>,
}

/// Handle to the realtime link. Cheap to clone; all clones share one
/// underlying session.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Create a transport for the given server. Nothing is dialed until
    /// [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(server_url: &str, token: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                server_url: server_url.trim_end_matches('/').to_string(),
                policy,
                state: Mutex::new(LinkState {
                    token: token.into(),
                    ..LinkState::default()
                }),
                generation: watch::Sender::new(0),
                lifecycle: broadcast::channel(LIFECYCLE_CAPACITY).0,
                events: broadcast::channel(EVENT_CAPACITY).0,
            }),
        }
    }

    /// Dial the server and start the frame pump.
    ///
    /// Calling this while a link is already up replaces it: the previous
    /// driver shuts down and a fresh session is established.
    pub async fn connect(&self) -> AppResult<()> {
        let generation = self.bump_generation();

        let mut socket = match dial(&self.inner).await {
            Ok(socket) => socket,
            Err(error) => {
                let mut state = self.lock_state();
                if *self.inner.generation.borrow() == generation {
                    state.connected = false;
                    state.outbound = None;
                }
                return Err(error);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let installed = {
            let mut state = self.lock_state();
            if *self.inner.generation.borrow() == generation {
                state.outbound = Some(outbound_tx);
                state.connected = true;
                true
            } else {
                false
            }
        };
        if !installed {
            // A newer connect or a disconnect landed while this dial was
            // in flight; that call owns the link now.
            let _ = socket.close(None).await;
            return Ok(());
        }

        tracing::debug!(url = %self.inner.server_url, "Realtime link established");
        let _ = self.inner.lifecycle.send(ConnectionEvent::Established);

        tokio::spawn(drive(
            Arc::clone(&self.inner),
            generation,
            socket,
            outbound_rx,
        ));
        Ok(())
    }

    /// Replace the bearer credential, then dial as [`connect`](Self::connect)
    /// does. The fresh token is used for this dial and for every reconnect
    /// attempt that follows, which is the way back onto the server after a
    /// [`ConnectionEvent::TokenExpired`] tear-down.
    pub async fn connect_with_token(&self, token: impl Into<String>) -> AppResult<()> {
        self.lock_state().token = token.into();
        self.connect().await
    }

    /// Close the link and stop reconnecting. No lifecycle event is
    /// emitted; the shutdown was asked for.
    pub fn disconnect(&self) {
        self.bump_generation();
        let mut state = self.lock_state();
        state.connected = false;
        state.outbound = None;
        tracing::debug!("Realtime link closed by client");
    }

    /// Whether a session is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    /// Queue an event for the server. Dropped with a warning when the
    /// link is down; callers relying on delivery should check
    /// [`is_connected`](Self::is_connected) or re-send after the next
    /// `Reconnected` lifecycle event.
    pub fn emit(&self, event: &ClientEvent) {
        let state = self.lock_state();
        if !state.connected {
            tracing::warn!("Not connected; client event dropped");
            return;
        }
        if let Some(outbound) = &state.outbound {
            if outbound.send(event.clone()).is_err() {
                tracing::warn!("Realtime link going away; client event dropped");
            }
        }
    }

    /// Subscribe to decoded server events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to link lifecycle transitions.
    #[must_use]
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.lifecycle.subscribe()
    }

    fn bump_generation(&self) -> u64 {
        let next = *self.inner.generation.borrow() + 1;
        self.inner.generation.send_replace(next);
        next
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        lock_link_state(&self.inner)
    }
}

fn websocket_url(server_url: &str, token: &str) -> AppResult<String> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(AppError::Transport(format!(
            "Unsupported server URL scheme: {server_url}"
        )));
    };
    Ok(format!("{base}/realtime?token={token}"))
}

async fn dial(inner: &TransportInner) -> AppResult<WsStream> {
    let token = lock_link_state(inner).token.clone();
    let url = websocket_url(&inner.server_url, &token)?;
    let (socket, _response) = connect_async(&url)
        .await
        .map_err(|error| AppError::Transport(error.to_string()))?;
    Ok(socket)
}

fn lock_link_state(inner: &TransportInner) -> MutexGuard<'_, LinkState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_connected(inner: &TransportInner, connected: bool) {
    lock_link_state(inner).connected = connected;
}

/// Flip the link back up, unless a newer connect or a disconnect took
/// over while the driver was away redialing.
fn mark_connected_if_current(inner: &TransportInner, generation: u64) -> bool {
    let mut state = lock_link_state(inner);
    if *inner.generation.borrow() != generation {
        return false;
    }
    state.connected = true;
    true
}

/// Terminal shutdown: the outbound sender is dropped so queued events do
/// not linger for a link that will never come back.
fn tear_down(inner: &TransportInner) {
    let mut state = lock_link_state(inner);
    state.connected = false;
    state.outbound = None;
}

async fn drive(
    inner: Arc<TransportInner>,
    generation: u64,
    mut socket: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut generation_rx = inner.generation.subscribe();

    loop {
        match pump(&inner, &mut socket, &mut outbound, generation, &mut generation_rx).await {
            PumpExit::Superseded => {
                let _ = socket.close(None).await;
                return;
            }
            PumpExit::TokenExpired => {
                tear_down(&inner);
                tracing::warn!("Session token expired; realtime link closed");
                let _ = inner.lifecycle.send(ConnectionEvent::TokenExpired);
                return;
            }
            PumpExit::Lost(reason) => {
                set_connected(&inner, false);
                tracing::warn!(reason = %reason, "Realtime link lost");
                let _ = inner.lifecycle.send(ConnectionEvent::Lost { reason });

                match reestablish(&inner, generation, &mut generation_rx).await {
                    Reestablish::Connected {
                        socket: mut fresh,
                        attempt,
                    } => {
                        if !mark_connected_if_current(&inner, generation) {
                            let _ = fresh.close(None).await;
                            return;
                        }
                        socket = fresh;
                        tracing::info!(attempt, "Realtime link re-established");
                        let _ = inner.lifecycle.send(ConnectionEvent::Reconnected { attempt });
                    }
                    Reestablish::GaveUp => {
                        tear_down(&inner);
                        tracing::error!("Reconnection attempts exhausted; realtime link stays down");
                        let _ = inner.lifecycle.send(ConnectionEvent::Failed);
                        return;
                    }
                    Reestablish::Superseded => return,
                }
            }
        }
    }
}

async fn pump(
    inner: &TransportInner,
    socket: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
    generation: u64,
    generation_rx: &mut watch::Receiver<u64>,
) -> PumpExit {
    loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(ServerEvent::TokenExpired) => return PumpExit::TokenExpired,
                    Ok(event) => {
                        let _ = inner.events.send(event);
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "Dropping malformed server frame");
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = socket.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::Lost("connection closed".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return PumpExit::Lost(error.to_string()),
            },
            Some(event) = outbound.recv() => {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if let Err(error) = socket.send(Message::text(json)).await {
                            return PumpExit::Lost(error.to_string());
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "Dropping unserializable client event");
                    }
                }
            }
            // `wait_for` inspects the current value, so a bump that landed
            // before this driver was first polled still supersedes it. The
            // returned `watch::Ref` guard is dropped inside the block so the
            // select future stays `Send`.
            () = async { let _ = generation_rx.wait_for(|current| *current != generation).await; } => {
                return PumpExit::Superseded;
            }
        }
    }
}

async fn reestablish(
    inner: &TransportInner,
    generation: u64,
    generation_rx: &mut watch::Receiver<u64>,
) -> Reestablish {
    let mut attempt = 0;
    while inner.policy.should_retry(attempt) {
        let delay = inner.policy.delay_for_attempt(attempt);
        attempt += 1;
        tracing::debug!(attempt, ?delay, "Scheduling reconnect attempt");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = generation_rx.wait_for(|current| *current != generation) => {
                return Reestablish::Superseded;
            }
        }

        match dial(inner).await {
            Ok(socket) => return Reestablish::Connected { socket, attempt },
            Err(error) => {
                tracing::warn!(attempt, error = %error, "Reconnect attempt failed");
                let _ = inner.lifecycle.send(ConnectionEvent::Error {
                    reason: error.to_string(),
                });
            }
        }
    }
    Reestablish::GaveUp
}
