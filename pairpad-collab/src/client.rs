//! WebSocket client for connecting to the collaboration hub.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, bounded auto-reconnect)
//! - Typed send/receive of the room event vocabulary
//! - A [`SessionEvent`] stream for the application
//!
//! Reconnection restores ONLY the transport channel. The hub forgets a
//! connection's memberships the moment the old socket drops, and the client
//! does not replay `join-room`: after every [`SessionEvent::Connected`] the
//! caller is responsible for re-joining its room. "Connected but not joined"
//! is therefore a real state the application must represent.
//!
//! Frames produced while the channel is down are dropped — delivery across
//! disconnect windows is out of contract.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Channel established (initial connect or reconnect). Room membership
    /// is NOT restored — re-issue `join_room`.
    Connected,
    /// Channel lost; reconnection attempts are running.
    ConnectionLost,
    /// Reconnection exhausted or the caller disconnected; the client is done.
    Disconnected,
    /// A hub event delivered for this connection.
    Remote(ServerEvent),
}

/// Reconnection policy: bounded attempts, exponential backoff with a cap.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// The hub client.
///
/// Owns the WebSocket transport and a pair of channels: outbound
/// [`ClientEvent`]s (also reachable through [`CollabClient::sender`] for
/// components that emit on their own, like the editor agent) and inbound
/// [`SessionEvent`]s for the application.
pub struct CollabClient {
    server_url: String,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Consumed by the supervisor on connect.
    outgoing_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    shutdown: Arc<Notify>,
}

impl CollabClient {
    /// Create a new client for the given hub URL (e.g. `ws://127.0.0.1:3001`).
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_policy(server_url, ReconnectPolicy::default())
    }

    /// Create with an explicit reconnect policy.
    pub fn with_policy(server_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            policy,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            event_tx,
            event_rx: Some(event_rx),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect to the hub and spawn the transport supervisor.
    ///
    /// Fails if the initial connection cannot be established (the caller may
    /// call `connect` again). Once connected, transport loss is handled by
    /// the supervisor's bounded reconnect loop.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let out_rx = self
            .outgoing_rx
            .take()
            .ok_or(ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connecting;
        let ws = match connect_async(&self.server_url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                self.outgoing_rx = Some(out_rx);
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SessionEvent::Connected).await;

        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        let url = self.server_url.clone();
        let policy = self.policy;
        tokio::spawn(async move {
            Self::supervise(ws, out_rx, event_tx, state, shutdown, url, policy).await;
        });

        Ok(())
    }

    /// Drive one transport session, then reconnect with capped backoff until
    /// the policy is exhausted or the caller disconnects.
    async fn supervise(
        first: WsStream,
        mut out_rx: mpsc::UnboundedReceiver<ClientEvent>,
        event_tx: mpsc::Sender<SessionEvent>,
        state: Arc<RwLock<ConnectionState>>,
        shutdown: Arc<Notify>,
        url: String,
        policy: ReconnectPolicy,
    ) {
        let mut ws = first;
        loop {
            let clean = Self::run_session(ws, &mut out_rx, &event_tx, &shutdown).await;
            if clean {
                *state.write().await = ConnectionState::Disconnected;
                let _ = event_tx.send(SessionEvent::Disconnected).await;
                return;
            }

            *state.write().await = ConnectionState::Reconnecting;
            let _ = event_tx.send(SessionEvent::ConnectionLost).await;

            let mut delay = policy.initial_delay;
            let mut attempt = 0u32;
            let next = loop {
                if attempt >= policy.max_attempts {
                    break None;
                }
                attempt += 1;
                tokio::select! {
                    _ = shutdown.notified() => break None,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(policy.max_delay);
                match connect_async(&url).await {
                    Ok((stream, _)) => break Some(stream),
                    Err(e) => {
                        log::warn!(
                            "Reconnect attempt {attempt}/{} to {url} failed: {e}",
                            policy.max_attempts
                        );
                    }
                }
            };

            match next {
                Some(stream) => {
                    // Anything produced during the outage is undeliverable.
                    let mut discarded = 0usize;
                    while out_rx.try_recv().is_ok() {
                        discarded += 1;
                    }
                    if discarded > 0 {
                        log::debug!("Discarded {discarded} frames produced while disconnected");
                    }
                    ws = stream;
                    *state.write().await = ConnectionState::Connected;
                    let _ = event_tx.send(SessionEvent::Connected).await;
                    log::info!("Reconnected to {url}; room membership must be re-established");
                }
                None => {
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(SessionEvent::Disconnected).await;
                    return;
                }
            }
        }
    }

    /// Pump one socket until it drops. Returns true for a caller-initiated
    /// close (no reconnect), false for transport loss.
    async fn run_session(
        ws: WsStream,
        out_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
        event_tx: &mpsc::Sender<SessionEvent>,
        shutdown: &Notify,
    ) -> bool {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return true;
                }

                out = out_rx.recv() => {
                    match out {
                        Some(event) => match event.encode() {
                            Ok(frame) => {
                                if sink.send(Message::Text(frame.into())).await.is_err() {
                                    return false;
                                }
                            }
                            Err(e) => log::warn!("Failed to encode outbound event: {e}"),
                        },
                        // Every sender dropped: nothing left to say.
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return true;
                        }
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => {
                            match ServerEvent::decode(raw.as_str()) {
                                Ok(event) => {
                                    let _ = event_tx.send(SessionEvent::Remote(event)).await;
                                }
                                Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return false,
                        Some(Err(e)) => {
                            log::warn!("Transport error: {e}");
                            return false;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Send an event to the hub. Dropped (with a debug log) unless the
    /// channel is currently connected.
    pub async fn send(&self, event: ClientEvent) {
        if *self.state.read().await != ConnectionState::Connected {
            log::debug!("Dropping outbound event while disconnected");
            return;
        }
        let _ = self.outgoing_tx.send(event);
    }

    /// Join a room. Must be re-issued after every reconnect.
    pub async fn join_room(
        &self,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) {
        self.send(ClientEvent::JoinRoom {
            room_id: room_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
        })
        .await;
    }

    /// Leave a room explicitly.
    pub async fn leave_room(&self, room_id: impl Into<String>) {
        self.send(ClientEvent::LeaveRoom {
            room_id: room_id.into(),
        })
        .await;
    }

    /// Close the channel and stop the supervisor. No reconnection follows.
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }

    /// A handle for components that emit outbound events on their own
    /// (e.g. the editor agent's debounced `code-change`s).
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.outgoing_tx.clone()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the hub URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
