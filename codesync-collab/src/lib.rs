//! # codesync-collab — Real-time collaboration sync layer for CodeSync
//!
//! Participants editing the same project share presence, cursors, live
//! buffer content, save notifications and chat through a stateless
//! WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   commands    ┌──────────────┐   JSON text   ┌──────────────┐
//! │ SessionHandle│ ────────────► │ SessionLoop  │ ◄───────────► │ RelayServer  │
//! │ (UI side)    │ ◄──────────── │ (actor task) │   Transport   │ (per project │
//! └──────────────┘   snapshots   └──────┬───────┘               │  rooms)      │
//!                                       │                       └──────────────┘
//!                    ┌──────────────────┼──────────────────┐
//!                    ▼                  ▼                  ▼
//!            PresenceDirectory  CursorSynchronizer  CodeChangePropagator
//!                               SaveNotifier · ChatLog · OpenBuffers
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope wire format and identity stamping
//! - [`bus`] — Typed event bus between transport and session
//! - [`client`] — WebSocket transport with bounded reconnects
//! - [`presence`] — Roster, locations, typing and colour hints
//! - [`cursor`] — Remote cursor state and editor decorations
//! - [`propagator`] — Debounced code-change broadcast
//! - [`save`] — Save broadcast and transient notices
//! - [`session`] — Session actor, handle and project switching
//! - [`broadcast`] — Relay rooms with fan-out
//! - [`server`] — WebSocket relay server

pub mod protocol;
pub mod error;
pub mod config;
pub mod bus;
pub mod client;
pub mod store;
pub mod buffer;
pub mod presence;
pub mod cursor;
pub mod propagator;
pub mod save;
pub mod chat;
pub mod session;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    Envelope, EnvelopeCodec, EnvelopeKind, FileId, ParticipantId, ParticipantInfo,
    Payload, ProjectId, ProtocolError, SessionIdentity,
};
pub use error::{Ignored, SessionError};
pub use config::CollabConfig;
pub use bus::{CollabEvent, EventBus, EventKind, Subscription};
pub use client::{ConnectionState, Transport, TransportError};
pub use store::{FileStore, MemoryFileStore, StoreError};
pub use buffer::{OpenBuffer, OpenBuffers};
pub use presence::{ColorHint, Participant, PresenceDirectory, PresenceLocation, RosterEntry};
pub use cursor::{
    compute_decorations, CursorSource, CursorState, CursorSynchronizer, Decoration,
    DecorationKind, DecorationRange,
};
pub use propagator::{BufferUpdate, CodeChangePropagator};
pub use save::{SaveNotice, SaveNotifier};
pub use chat::{ChatEntry, ChatLog};
pub use session::{
    CollabSession, EditorSurface, SessionHandle, SessionManager, SessionSnapshot, SessionState,
};
pub use broadcast::{ProjectRoom, RoomManager};
pub use server::{RelayServer, ServerConfig, ServerError, ServerStats};
