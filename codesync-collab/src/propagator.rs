//! Code change propagation: debounced full-document broadcast of local
//! edits and last-writer-wins application of remote ones.
//!
//! ```text
//! keystroke ─► local_edit() ──► user_typing{true}   (first edit only)
//!                  │
//!                  ▼ (quiet for `debounce`)
//!              poll_due() ───► code_change{content}
//!                          └─► user_typing{false}
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::buffer::OpenBuffers;
use crate::error::Ignored;
use crate::protocol::{Envelope, FileId, ParticipantId, Payload};

/// A remote edit that landed in an open buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferUpdate {
    pub file_id: FileId,
    pub content: String,
    /// The file is active, so the visible editor text must be replaced.
    pub visible: bool,
}

#[derive(Debug, Clone)]
struct PendingChange {
    file_id: FileId,
    content: String,
    deadline: Instant,
}

pub struct CodeChangePropagator {
    local_id: ParticipantId,
    debounce: Duration,
    pending: Option<PendingChange>,
}

impl CodeChangePropagator {
    /// Create a propagator with nothing pending.
    pub fn new(local_id: ParticipantId, debounce: Duration) -> Self {
        Self {
            local_id,
            debounce,
            pending: None,
        }
    }

    /// Record a local edit. Returns payloads to send right away.
    ///
    /// An edit to a different file than the pending one flushes the
    /// pending change first.
    pub fn local_edit(&mut self, file_id: &FileId, content: String, now: Instant) -> Vec<Payload> {
        let mut outgoing = Vec::new();
        let same_file = self.pending_file().map(|pending| pending == file_id);
        if same_file == Some(false) {
            outgoing.extend(self.flush());
        }
        if same_file != Some(true) {
            outgoing.push(Payload::UserTyping {
                file_id: file_id.clone(),
                is_typing: true,
            });
        }
        self.pending = Some(PendingChange {
            file_id: file_id.clone(),
            content,
            deadline: now + self.debounce,
        });
        outgoing
    }

    /// When the pending change is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// File with an edit waiting for the debounce.
    pub fn pending_file(&self) -> Option<&FileId> {
        self.pending.as_ref().map(|p| &p.file_id)
    }

    /// Flush the pending change if its quiet period has elapsed.
    pub fn poll_due(&mut self, now: Instant) -> Vec<Payload> {
        if self.deadline().is_some_and(|deadline| deadline <= now) {
            self.flush()
        } else {
            Vec::new()
        }
    }

    /// Broadcast the pending change now, regardless of its deadline.
    pub fn flush(&mut self) -> Vec<Payload> {
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        log::debug!(
            "Broadcasting code change for {} ({} bytes)",
            pending.file_id,
            pending.content.len()
        );
        vec![
            Payload::CodeChange {
                file_id: pending.file_id.clone(),
                content: pending.content,
            },
            Payload::UserTyping {
                file_id: pending.file_id,
                is_typing: false,
            },
        ]
    }

    /// Drop the pending change without sending it.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            log::debug!("Discarding pending change for {}", pending.file_id);
        }
    }

    /// Drop the pending change for `file_id`. Returns the typing-stopped
    /// payload when something was dropped.
    pub fn cancel_file(&mut self, file_id: &FileId) -> Option<Payload> {
        if self.pending_file() != Some(file_id) {
            return None;
        }
        self.cancel();
        Some(Payload::UserTyping {
            file_id: file_id.clone(),
            is_typing: false,
        })
    }

    /// Apply an inbound `code_change` to the open buffers.
    pub fn apply_remote(
        &self,
        envelope: &Envelope,
        buffers: &mut OpenBuffers,
    ) -> Result<BufferUpdate, Ignored> {
        if envelope.is_from(&self.local_id) {
            return Err(Ignored::SelfEcho);
        }
        let Payload::CodeChange { file_id, content } = &envelope.payload else {
            return Err(Ignored::WrongKind);
        };
        let visible = buffers.apply_remote_content(file_id, content)?;
        log::debug!("Applied remote change to {file_id} from {}", envelope.user_id);
        Ok(BufferUpdate {
            file_id: file_id.clone(),
            content: content.clone(),
            visible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OpenBuffer;
    use crate::protocol::ProjectId;

    fn propagator() -> CodeChangePropagator {
        CodeChangePropagator::new(ParticipantId::from("me"), Duration::from_millis(500))
    }

    fn change(user: &str, file: &str, content: &str) -> Envelope {
        Envelope {
            project_id: ProjectId::from("1"),
            user_id: ParticipantId::from(user),
            user_name: user.into(),
            timestamp: 1,
            payload: Payload::CodeChange {
                file_id: FileId::from(file),
                content: content.into(),
            },
        }
    }

    fn kinds(payloads: &[Payload]) -> Vec<&'static str> {
        payloads.iter().map(|p| p.kind().as_str()).collect()
    }

    #[test]
    fn test_debounce_keeps_last_content() {
        let mut propagator = propagator();
        let file = FileId::from("a.js");
        let start = Instant::now();

        let first = propagator.local_edit(&file, "a".into(), start);
        assert_eq!(kinds(&first), vec!["user_typing"]);
        let second = propagator.local_edit(&file, "ab".into(), start + Duration::from_millis(200));
        assert!(second.is_empty());

        assert!(propagator
            .poll_due(start + Duration::from_millis(600))
            .is_empty());
        let flushed = propagator.poll_due(start + Duration::from_millis(700));
        assert_eq!(
            flushed,
            vec![
                Payload::CodeChange {
                    file_id: file.clone(),
                    content: "ab".into(),
                },
                Payload::UserTyping {
                    file_id: file,
                    is_typing: false,
                },
            ]
        );
        assert!(propagator.deadline().is_none());
    }

    #[test]
    fn test_switching_files_flushes_pending() {
        let mut propagator = propagator();
        let now = Instant::now();
        propagator.local_edit(&FileId::from("a"), "A".into(), now);
        let out = propagator.local_edit(&FileId::from("b"), "B".into(), now);
        assert_eq!(kinds(&out), vec!["code_change", "user_typing", "user_typing"]);
        assert_eq!(propagator.pending_file(), Some(&FileId::from("b")));
    }

    #[test]
    fn test_cancel_file() {
        let mut propagator = propagator();
        propagator.local_edit(&FileId::from("a"), "A".into(), Instant::now());
        assert!(propagator.cancel_file(&FileId::from("b")).is_none());
        assert!(propagator.cancel_file(&FileId::from("a")).is_some());
        assert!(propagator.flush().is_empty());
    }

    #[test]
    fn test_remote_change_applies_and_is_idempotent() {
        let propagator = propagator();
        let mut buffers = OpenBuffers::new();
        buffers.open(OpenBuffer::new(FileId::from("a.js"), "a.js", "old"));

        let update = propagator
            .apply_remote(&change("other", "a.js", "new"), &mut buffers)
            .unwrap();
        assert!(update.visible);
        let once = buffers.get(&FileId::from("a.js")).cloned();

        let _ = propagator.apply_remote(&change("other", "a.js", "new"), &mut buffers);
        assert_eq!(buffers.get(&FileId::from("a.js")).cloned(), once);
    }

    #[test]
    fn test_remote_change_for_unopened_file_dropped() {
        let propagator = propagator();
        let mut buffers = OpenBuffers::new();
        assert_eq!(
            propagator.apply_remote(&change("other", "app.py", "x"), &mut buffers),
            Err(Ignored::FileNotOpen)
        );
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_own_change_ignored() {
        let propagator = propagator();
        let mut buffers = OpenBuffers::new();
        buffers.open(OpenBuffer::new(FileId::from("a.js"), "a.js", "old"));
        assert_eq!(
            propagator.apply_remote(&change("me", "a.js", "new"), &mut buffers),
            Err(Ignored::SelfEcho)
        );
        assert_eq!(buffers.get(&FileId::from("a.js")).unwrap().content, "old");
    }
}
