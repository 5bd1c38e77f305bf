//! In-memory project chat log. Not persisted, not replayed on join.

use std::collections::VecDeque;

use crate::error::Ignored;
use crate::protocol::{Envelope, ParticipantId, Payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub from: ParticipantId,
    pub from_name: String,
    pub message: String,
    pub timestamp: i64,
}

/// Bounded history; the oldest entry goes first when full.
pub struct ChatLog {
    local_id: ParticipantId,
    capacity: usize,
    entries: VecDeque<ChatEntry>,
}

impl ChatLog {
    pub fn new(local_id: ParticipantId, capacity: usize) -> Self {
        Self {
            local_id,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&mut self, entry: ChatEntry) -> &ChatEntry {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Record an inbound chat envelope from another participant.
    pub fn apply_remote(&mut self, envelope: &Envelope) -> Result<&ChatEntry, Ignored> {
        if envelope.is_from(&self.local_id) {
            return Err(Ignored::SelfEcho);
        }
        let Payload::ChatMessage { message } = &envelope.payload else {
            return Err(Ignored::WrongKind);
        };
        Ok(self.push(ChatEntry {
            from: envelope.user_id.clone(),
            from_name: envelope.user_name.clone(),
            message: message.clone(),
            timestamp: envelope.timestamp,
        }))
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
