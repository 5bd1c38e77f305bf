//! Session-level errors and the reasons inbound updates get absorbed.

use thiserror::Error;

use crate::client::TransportError;
use crate::protocol::{FileId, ProtocolError};
use crate::store::StoreError;

/// Why an update was not applied. Logged at debug level, never shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ignored {
    #[error("echo of our own broadcast")]
    SelfEcho,
    #[error("timestamp not newer than stored state")]
    Stale,
    #[error("file is not open locally")]
    FileNotOpen,
    #[error("line and column must be positive")]
    InvalidPosition,
    #[error("participant is not known")]
    UnknownParticipant,
    #[error("nothing changed")]
    Unchanged,
    #[error("envelope kind not handled here")]
    WrongKind,
}

/// Errors surfaced to callers of a session handle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("file store error: {0}")]
    Store(#[from] StoreError),
    #[error("file {0} is not open")]
    FileNotOpen(FileId),
    #[error("session has shut down")]
    Closed,
}
