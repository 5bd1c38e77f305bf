//! WebSocket transport for one project collaboration session.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, bounded reconnect)
//! - Fire-and-forget sends (dropped with a warning while not connected)
//! - Inbound frames decoded and published on the [`EventBus`], and
//!   optionally on a lossless feed for the session loop
//!
//! ```text
//!            connect()
//!               │
//!               ▼
//!   ┌──── Connecting ────┐ open failed / abnormal close
//!   │          │         ▼
//!   │          │    Reconnecting (attempt n, wait n × base) ──┐
//!   │          ▼         ▲                                    │
//!   │      Connected ────┘                    n > max         │
//!   │          │ close 1000 / disconnect()       ▼            │
//!   └────► Disconnected                        Failed ◄───────┘
//! ```

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::bus::{CollabEvent, EventBus};
use crate::config::CollabConfig;
use crate::protocol::{Envelope, ParticipantId, ProjectId};

/// Close code for an intentional disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect budget exhausted; nothing further happens automatically.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to open socket: {0}")]
    Connect(String),
    #[error("socket closed unexpectedly with code {code}")]
    Closed { code: u16 },
}

/// Build `{server_url}/{project_id}?userId=..&userName=..`.
pub fn session_url(
    server_url: &str,
    project_id: &ProjectId,
    user_id: &ParticipantId,
    user_name: &str,
) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let mut url = Url::parse(server_url).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("url cannot carry a path".to_string()))?
        .pop_if_empty()
        .push(project_id.as_str());
    url.query_pairs_mut()
        .append_pair("userId", user_id.as_str())
        .append_pair("userName", user_name);
    Ok(url)
}

/// Owns at most one live socket (plus its reconnect loop) at a time.
pub struct Transport {
    config: CollabConfig,
    bus: EventBus,
    feed: Option<mpsc::Sender<CollabEvent>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Transport {
    /// Create a disconnected transport publishing on `bus`.
    pub fn new(config: CollabConfig, bus: EventBus) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            bus,
            feed: None,
            state_tx,
            state_rx,
            outgoing_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Also deliver every event to `feed`, in order and without loss.
    ///
    /// The reader waits for room in the channel instead of dropping, so a
    /// slow consumer pushes back on the socket. The bus stays lossy.
    pub fn with_feed(mut self, feed: mpsc::Sender<CollabEvent>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Open the project socket. Any previous session is torn down first,
    /// including a pending reconnect timer.
    ///
    /// Returns once the connection task is running; the outcome arrives on
    /// the bus as `Connected`, `Reconnecting` or `Error`.
    pub async fn connect(
        &mut self,
        project_id: &ProjectId,
        user_id: &ParticipantId,
        user_name: &str,
    ) -> Result<(), TransportError> {
        let url = session_url(&self.config.server_url, project_id, user_id, user_name)?;
        if self.task.is_some() {
            self.disconnect().await;
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.outgoing_tx = Some(outgoing_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.state_tx.send_replace(ConnectionState::Connecting);

        let supervisor = Supervisor {
            url: url.to_string(),
            project_id: project_id.clone(),
            config: self.config.clone(),
            bus: self.bus.clone(),
            feed: self.feed.clone(),
            state_tx: self.state_tx.clone(),
        };
        self.task = Some(tokio::spawn(supervisor.run(outgoing_rx, shutdown_rx)));
        log::info!("Connecting to project {project_id} as {user_id}");
        Ok(())
    }

    /// Close with code 1000. Never triggers a reconnect; cancels one
    /// that is already scheduled.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Transport task ended abnormally: {e}");
            }
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Fire-and-forget. Returns whether the frame was handed to the writer.
    pub fn send(&self, frame: String) -> bool {
        if !self.is_connected() {
            log::warn!("Not connected, dropping outbound frame ({} bytes)", frame.len());
            return false;
        }
        let Some(tx) = &self.outgoing_tx else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound channel full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Connection task gone, dropping frame");
                false
            }
        }
    }

    /// Whether a socket is open right now.
    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Observe state changes (connection indicator).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The bus this transport publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(());
        }
    }
}

/// How a live socket ended.
enum SocketEnd {
    Shutdown,
    Closed { code: u16, reason: String },
}

/// Background task: connect, pump, back off, repeat within budget.
struct Supervisor {
    url: String,
    project_id: ProjectId,
    config: CollabConfig,
    bus: EventBus,
    feed: Option<mpsc::Sender<CollabEvent>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Supervisor {
    /// Deliver to the feed (waiting for room), then to the bus.
    async fn emit(&self, event: CollabEvent) {
        if let Some(feed) = &self.feed {
            if feed.send(event.clone()).await.is_err() {
                log::debug!("Event feed closed, bus only");
            }
        }
        self.bus.publish(event);
    }

    async fn run(
        self,
        mut outgoing_rx: mpsc::Receiver<String>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            let opened = tokio::select! {
                _ = &mut shutdown_rx => break,
                opened = tokio_tungstenite::connect_async(self.url.as_str()) => opened,
            };

            match opened {
                Ok((socket, _)) => {
                    attempt = 0;
                    self.state_tx.send_replace(ConnectionState::Connected);
                    log::info!("Connected to project {}", self.project_id);
                    self.emit(CollabEvent::Connected {
                        project_id: self.project_id.clone(),
                    })
                    .await;

                    let end = self.pump(socket, &mut outgoing_rx, &mut shutdown_rx).await;
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    match end {
                        SocketEnd::Shutdown => {
                            self.emit(CollabEvent::Disconnected {
                                code: NORMAL_CLOSURE,
                                reason: "User disconnected".to_string(),
                            })
                            .await;
                            return;
                        }
                        SocketEnd::Closed { code, reason } => {
                            log::info!("Socket closed: {code} {reason}");
                            self.emit(CollabEvent::Disconnected { code, reason }).await;
                            if code == NORMAL_CLOSURE {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Failed to open socket to {}: {e}", self.url);
                    self.emit(CollabEvent::Error {
                        message: TransportError::Connect(e.to_string()).to_string(),
                        terminal: false,
                    })
                    .await;
                }
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                self.state_tx.send_replace(ConnectionState::Failed);
                log::error!(
                    "Giving up on project {} after {} reconnect attempts",
                    self.project_id,
                    self.config.max_reconnect_attempts
                );
                self.emit(CollabEvent::Error {
                    message: "Unable to reconnect to the collaboration server".to_string(),
                    terminal: true,
                })
                .await;
                return;
            }

            let delay = self.config.reconnect_delay(attempt);
            self.state_tx.send_replace(ConnectionState::Reconnecting);
            self.emit(CollabEvent::Reconnecting { attempt, delay }).await;
            log::info!("Reconnect attempt {attempt} in {delay:?}");

            let backoff = tokio::time::sleep(delay);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    _ = &mut shutdown_rx => {
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    frame = outgoing_rx.recv() => match frame {
                        Some(_) => log::warn!("Reconnecting, dropping outbound frame"),
                        None => return,
                    },
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    async fn pump(
        &self,
        socket: Socket,
        outgoing_rx: &mut mpsc::Receiver<String>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> SocketEnd {
        let (mut writer, mut reader) = socket.split();

        loop {
            tokio::select! {
                _ = &mut *shutdown_rx => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "User disconnected".into(),
                    }));
                    if let Err(e) = writer.send(close).await {
                        log::debug!("Close frame not delivered: {e}");
                    }
                    return SocketEnd::Shutdown;
                }
                frame = outgoing_rx.recv() => {
                    let Some(frame) = frame else {
                        return SocketEnd::Shutdown;
                    };
                    if let Err(e) = writer.send(Message::text(frame)).await {
                        return SocketEnd::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        };
                    }
                }
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => SocketEnd::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_string(),
                            },
                            None => SocketEnd::Closed {
                                code: NO_STATUS,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SocketEnd::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        return SocketEnd::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".to_string(),
                        };
                    }
                },
            }
        }
    }

    /// Malformed frames are dropped here and never reach consumers.
    async fn dispatch(&self, frame: &str) {
        match Envelope::decode(frame) {
            Ok(envelope) => {
                log::debug!("Inbound {} from {}", envelope.kind(), envelope.user_id);
                self.emit(CollabEvent::Inbound(envelope)).await;
            }
            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
        }
    }
}
