//! Save notifications: broadcast local saves, apply remote ones and keep
//! the transient "saved by someone else" notices.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::buffer::OpenBuffers;
use crate::error::Ignored;
use crate::propagator::BufferUpdate;
use crate::protocol::{Envelope, FileId, ParticipantId, Payload};

/// Transient notice shown after a remote save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveNotice {
    pub id: u64,
    pub file_id: FileId,
    pub file_name: String,
    pub by_whom: String,
    pub expires_at: Instant,
}

/// Outcome of an accepted remote save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSave {
    pub update: BufferUpdate,
    pub notice: SaveNotice,
}

pub struct SaveNotifier {
    local_id: ParticipantId,
    ttl: Duration,
    notices: VecDeque<SaveNotice>,
    next_id: u64,
}

impl SaveNotifier {
    /// Create a notifier whose notices live for `ttl`.
    pub fn new(local_id: ParticipantId, ttl: Duration) -> Self {
        Self {
            local_id,
            ttl,
            notices: VecDeque::new(),
            next_id: 1,
        }
    }

    /// The store accepted the buffer's content: clear `unsaved` and build
    /// the `file_saved` broadcast.
    pub fn local_saved(&self, buffers: &mut OpenBuffers, file_id: &FileId) -> Result<Payload, Ignored> {
        let buffer = buffers.mark_saved(file_id)?;
        Ok(Payload::FileSaved {
            file_id: buffer.file_id.clone(),
            file_name: buffer.file_name.clone(),
            content: buffer.content.clone(),
        })
    }

    /// Apply an inbound `file_saved`. The remote content wins over any
    /// unsaved local edits.
    pub fn apply_remote(
        &mut self,
        envelope: &Envelope,
        buffers: &mut OpenBuffers,
        now: Instant,
    ) -> Result<RemoteSave, Ignored> {
        if envelope.is_from(&self.local_id) {
            return Err(Ignored::SelfEcho);
        }
        let Payload::FileSaved {
            file_id,
            file_name,
            content,
        } = &envelope.payload
        else {
            return Err(Ignored::WrongKind);
        };

        let visible = buffers.apply_saved(file_id, content)?;
        let file_name = if file_name.is_empty() {
            buffers
                .file_name(file_id)
                .map(str::to_string)
                .unwrap_or_else(|| file_id.to_string())
        } else {
            file_name.clone()
        };
        let by_whom = if envelope.user_name.is_empty() {
            "Another user".to_string()
        } else {
            envelope.user_name.clone()
        };
        log::info!("{file_name} saved by {by_whom}");

        let notice = SaveNotice {
            id: self.next_id,
            file_id: file_id.clone(),
            file_name,
            by_whom,
            expires_at: now + self.ttl,
        };
        self.next_id += 1;
        self.notices.push_back(notice.clone());

        Ok(RemoteSave {
            update: BufferUpdate {
                file_id: file_id.clone(),
                content: content.clone(),
                visible,
            },
            notice,
        })
    }

    /// Earliest notice expiry.
    pub fn deadline(&self) -> Option<Instant> {
        self.notices.front().map(|n| n.expires_at)
    }

    /// Remove and return every notice expired at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<SaveNotice> {
        let mut expired = Vec::new();
        while self.notices.front().is_some_and(|n| n.expires_at <= now) {
            if let Some(notice) = self.notices.pop_front() {
                expired.push(notice);
            }
        }
        expired
    }

    /// Live notices, oldest first.
    pub fn notices(&self) -> impl Iterator<Item = &SaveNotice> {
        self.notices.iter()
    }

    /// Drop every notice without dismissing it.
    pub fn clear(&mut self) {
        self.notices.clear();
    }
}
