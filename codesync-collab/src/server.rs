//! WebSocket relay server with project-scoped rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /ws/collaboration/{projectId}?userId=..&userName=..
//!            ├── ProjectRoom (projectId) ── broadcast channel
//! Client B ──┘           │
//!                        ├── users_list  → newcomer only
//!                        ├── user_joined → everyone, newcomer included
//!                        ├── client frames → everyone but the sender
//!                        └── user_left   → remaining members
//! ```
//!
//! The relay keeps no document state: client frames are forwarded
//! verbatim once they classify as a client-originated envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;
use uuid::Uuid;

use crate::broadcast::{ProjectRoom, RoomManager};
use crate::presence::ColorHint;
use crate::protocol::{Envelope, ParticipantId, ParticipantInfo, Payload, ProjectId, ProtocolError};

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Upgrade path prefix; the project id is the next segment
    pub path_prefix: String,
    /// Members per project; 0 = unlimited
    pub max_participants_per_project: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path_prefix: "/ws/collaboration".to_string(),
            max_participants_per_project: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Who is asking to join which project, parsed from the upgrade URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub project_id: Option<ProjectId>,
    pub user_id: ParticipantId,
    pub user_name: String,
}

impl JoinRequest {
    /// Parse `{prefix}/{projectId}?userId=..&userName=..`.
    ///
    /// Missing user fields fall back to anonymous defaults; a missing or
    /// mis-prefixed project yields `project_id: None`.
    pub fn parse(path_and_query: &str, prefix: &str) -> Self {
        let parsed = Url::parse("ws://relay.invalid").and_then(|base| base.join(path_and_query));
        let mut request = JoinRequest {
            project_id: None,
            user_id: ParticipantId::from("anonymous"),
            user_name: "Anonymous".to_string(),
        };
        let Ok(url) = parsed else {
            return request;
        };

        let prefix = prefix.trim_end_matches('/');
        request.project_id = url
            .path()
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.split('/').next())
            .filter(|segment| !segment.is_empty())
            .map(ProjectId::from);

        for (key, value) in url.query_pairs() {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "userId" => request.user_id = ParticipantId::from(value.as_ref()),
                "userName" => request.user_name = value.into_owned(),
                _ => {}
            }
        }
        request
    }
}

fn server_envelope(project_id: &ProjectId, user: Option<&ParticipantInfo>, payload: Payload) -> Envelope {
    Envelope {
        project_id: project_id.clone(),
        user_id: user.map(|u| u.id.clone()).unwrap_or_default(),
        user_name: user.map(|u| u.name.clone()).unwrap_or_default(),
        timestamp: Utc::now().timestamp_millis(),
        payload,
    }
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a relay with no rooms.
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create a relay with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Relay listening on {} ({})",
            listener.local_addr()?,
            self.config.path_prefix
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let mut target = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                target = request
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_default();
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
        }

        let request = JoinRequest::parse(&target, &config.path_prefix);
        let Some(project_id) = request.project_id else {
            log::warn!("Rejecting {addr}: no project id in {target:?}");
            stats.write().await.rejected_connections += 1;
            ws_sender
                .send(close_message(CloseCode::Invalid, "Project ID is required"))
                .await?;
            return Ok(());
        };

        let connection_id = Uuid::new_v4();
        let info = ParticipantInfo {
            color: Some(ColorHint::for_participant(&request.user_id).hex().to_string()),
            id: request.user_id,
            name: request.user_name,
        };

        let joined = rooms
            .join(&project_id, connection_id, info.clone(), config.max_participants_per_project)
            .await;
        let (room, mut broadcast_rx) = match joined {
            Ok(joined) => joined,
            Err(full) => {
                log::warn!("Rejecting {} for project {project_id}: {full}", info.id);
                stats.write().await.rejected_connections += 1;
                ws_sender
                    .send(close_message(CloseCode::Policy, "Project is full"))
                    .await?;
                return Ok(());
            }
        };

        {
            let mut s = stats.write().await;
            s.active_connections += 1;
            s.active_rooms = rooms.room_count().await;
        }
        log::info!("{} ({}) joined project {project_id} from {addr}", info.name, info.id);

        let greeting = Self::greet(&mut ws_sender, &room, &project_id, connection_id, &info).await;
        if greeting.is_ok() {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.as_str().len() as u64;
                            }
                            match Envelope::decode(text.as_str()) {
                                Ok(envelope) if envelope.kind().is_client_originated() => {
                                    log::trace!("Relaying {} in project {project_id}", envelope.kind());
                                    room.relay(connection_id, text.as_str());
                                }
                                Ok(envelope) => {
                                    log::debug!("Dropping {} from client {addr}", envelope.kind());
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::debug!("Pong to {addr} failed: {e}");
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    },

                    frame = broadcast_rx.recv() => match frame {
                        Ok(frame) => {
                            if !frame.is_for(connection_id) {
                                continue;
                            }
                            if let Err(e) = ws_sender.send(Message::text(frame.text.to_string())).await {
                                log::debug!("Send to {addr} failed: {e}");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {connection_id} lagged by {n} frames");
                            room.record_lag(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }

        // Cleanup: leave the room, tell whoever is left.
        drop(broadcast_rx);
        if let Some((left, remaining)) = rooms.leave(&project_id, &connection_id).await {
            log::info!("{} ({}) left project {project_id}", left.name, left.id);
            if let Some(room) = remaining {
                match server_envelope(&project_id, Some(&left), Payload::UserLeft).encode() {
                    Ok(frame) => {
                        room.relay(connection_id, frame);
                    }
                    Err(e) => log::error!("Failed to encode leave notice: {e}"),
                }
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        greeting
    }

    /// Roster snapshot to the newcomer, then the join notice to everyone.
    async fn greet(
        ws_sender: &mut WsSender,
        room: &ProjectRoom,
        project_id: &ProjectId,
        connection_id: Uuid,
        info: &ParticipantInfo,
    ) -> Result<(), ServerError> {
        let roster = server_envelope(
            project_id,
            None,
            Payload::UsersList {
                users: room.members().await,
            },
        )
        .encode()?;
        ws_sender.send(Message::text(roster)).await?;

        let joined = server_envelope(
            project_id,
            Some(info),
            Payload::UserJoined { user: info.clone() },
        )
        .encode()?;
        room.announce(connection_id, joined);
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Room registry, shared with connection tasks.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
