//! Presence directory: who is in the project and where they are.
//!
//! ## Flow
//!
//! ```text
//! inbound Envelope ──► apply_remote() ──┐ self echo? → Ignored::SelfEcho
//!                                       ▼
//! local intent ─────────────────────► apply(PresenceAction)
//!                                       │
//!                                       ▼
//!                               PresenceChange ──► roster_changed()
//! ```
//!
//! Self is held apart from the network roster so it is visible before the
//! relay echoes it and survives a roster replace.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;

use crate::error::Ignored;
use crate::protocol::{
    Envelope, FileId, ParticipantId, ParticipantInfo, Payload, ProjectId, SessionIdentity,
};

// ───────────────────────────────────────────────────────────────────
// Colour hints
// ───────────────────────────────────────────────────────────────────

/// Cursor palette shared by every client.
pub const PALETTE: [&str; 30] = [
    "#ff6b6b", "#4ecdc4", "#45b7d1", "#96ceb4", "#ffeaa7",
    "#dda0dd", "#ff7675", "#74b9ff", "#00b894", "#fdcb6e",
    "#e17055", "#81ecec", "#a29bfe", "#fd79a8", "#6c5ce7",
    "#55a3ff", "#ff9ff3", "#54a0ff", "#5f27cd", "#00d2d3",
    "#ff9f43", "#ee5a6f", "#00a8ff", "#c44569", "#f8b500",
    "#3c6382", "#40407a", "#706fd3", "#f3a683", "#cf6679",
];

/// Stable palette slot derived from a participant id.
///
/// Every client computes the same colour for the same id with no
/// coordination, so it survives reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorHint(usize);

impl ColorHint {
    /// Colour slot derived from the participant id.
    pub fn for_participant(id: &ParticipantId) -> Self {
        let hash = id_hash(id.as_str());
        Self((i64::from(hash).unsigned_abs() % PALETTE.len() as u64) as usize)
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// CSS hex colour, e.g. `#00d2d3`.
    pub fn hex(self) -> &'static str {
        PALETTE[self.0 % PALETTE.len()]
    }

    /// CSS `rgba(..)` form, used for translucent line highlights.
    pub fn rgba(self, alpha: f32) -> String {
        let hex = self.hex().trim_start_matches('#');
        let channel = |at: usize| u8::from_str_radix(&hex[at..at + 2], 16).unwrap_or(0);
        format!(
            "rgba({}, {}, {}, {})",
            channel(0),
            channel(2),
            channel(4),
            alpha.clamp(0.0, 1.0)
        )
    }
}

impl fmt::Display for ColorHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hex())
    }
}

/// 31-multiplier string hash over UTF-16 units with i32 wraparound.
fn id_hash(id: &str) -> i32 {
    id.encode_utf16().fold(0i32, |acc, unit| {
        acc.wrapping_shl(5)
            .wrapping_sub(acc)
            .wrapping_add(i32::from(unit))
    })
}

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub color: ColorHint,
}

impl Participant {
    /// Blank names become "Anonymous".
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let display_name = if display_name.trim().is_empty() {
            "Anonymous".to_string()
        } else {
            display_name
        };
        Self {
            color: ColorHint::for_participant(&id),
            id,
            display_name,
        }
    }
}

impl From<ParticipantInfo> for Participant {
    fn from(info: ParticipantInfo) -> Self {
        Participant::new(info.id, info.name)
    }
}

/// Last-known place of a participant. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceLocation {
    pub participant_id: ParticipantId,
    pub project_id: ProjectId,
    pub project_name: String,
    pub file_id: FileId,
    pub file_name: String,
    pub line: u32,
    pub column: u32,
    pub updated_at: i64,
}

/// One row of the presence sidebar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub participant: Participant,
    pub location: Option<PresenceLocation>,
    pub is_self: bool,
    pub typing_in: Option<FileId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceAction {
    Upsert(Participant),
    Remove(ParticipantId),
    /// Full roster snapshot; anyone absent is dropped.
    ReplaceRoster(Vec<Participant>),
    SetLocation(PresenceLocation),
    SetTyping {
        participant_id: ParticipantId,
        file_id: FileId,
        is_typing: bool,
    },
    /// Drop every remote participant (local connection lost).
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// Membership changed. `removed` lists who left.
    RosterChanged { removed: Vec<ParticipantId> },
    LocationChanged(ParticipantId),
    TypingChanged(ParticipantId),
}

// ───────────────────────────────────────────────────────────────────
// Directory
// ───────────────────────────────────────────────────────────────────

pub struct PresenceDirectory {
    local: Participant,
    project_id: ProjectId,
    project_name: String,
    /// Remote participants in join order.
    participants: IndexMap<ParticipantId, Participant>,
    locations: HashMap<ParticipantId, PresenceLocation>,
    typing: HashMap<ParticipantId, FileId>,
}

impl PresenceDirectory {
    /// Create a directory holding only the local participant.
    pub fn new(identity: &SessionIdentity) -> Self {
        Self {
            local: Participant::new(identity.user_id.clone(), identity.user_name.clone()),
            project_id: identity.project_id.clone(),
            project_name: identity.project_name.clone(),
            participants: IndexMap::new(),
            locations: HashMap::new(),
            typing: HashMap::new(),
        }
    }

    /// The local participant.
    pub fn local(&self) -> &Participant {
        &self.local
    }

    fn is_local(&self, id: &ParticipantId) -> bool {
        id == &self.local.id
    }

    fn is_known(&self, id: &ParticipantId) -> bool {
        self.is_local(id) || self.participants.contains_key(id)
    }

    /// Single mutation entry point.
    pub fn apply(&mut self, action: PresenceAction) -> Result<PresenceChange, Ignored> {
        match action {
            PresenceAction::Upsert(participant) => {
                if self.is_local(&participant.id) {
                    return Err(Ignored::SelfEcho);
                }
                if self.participants.get(&participant.id) == Some(&participant) {
                    return Err(Ignored::Unchanged);
                }
                log::info!("Participant joined: {} ({})", participant.display_name, participant.id);
                self.participants.insert(participant.id.clone(), participant);
                Ok(PresenceChange::RosterChanged { removed: Vec::new() })
            }

            PresenceAction::Remove(id) => {
                if self.is_local(&id) {
                    return Err(Ignored::SelfEcho);
                }
                if self.participants.shift_remove(&id).is_none() {
                    return Err(Ignored::UnknownParticipant);
                }
                self.locations.remove(&id);
                self.typing.remove(&id);
                log::info!("Participant left: {id}");
                Ok(PresenceChange::RosterChanged { removed: vec![id] })
            }

            PresenceAction::ReplaceRoster(roster) => {
                let incoming: IndexMap<ParticipantId, Participant> = roster
                    .into_iter()
                    .filter(|p| !self.is_local(&p.id))
                    .map(|p| (p.id.clone(), p))
                    .collect();
                let removed: Vec<ParticipantId> = self
                    .participants
                    .keys()
                    .filter(|id| !incoming.contains_key(*id))
                    .cloned()
                    .collect();
                for id in &removed {
                    self.locations.remove(id);
                    self.typing.remove(id);
                }
                self.participants = incoming;
                log::debug!(
                    "Roster replaced: {} remote participants, {} dropped",
                    self.participants.len(),
                    removed.len()
                );
                Ok(PresenceChange::RosterChanged { removed })
            }

            PresenceAction::SetLocation(location) => {
                let id = location.participant_id.clone();
                if !self.is_known(&id) {
                    return Err(Ignored::UnknownParticipant);
                }
                if let Some(current) = self.locations.get(&id) {
                    if location.updated_at <= current.updated_at {
                        return Err(Ignored::Stale);
                    }
                }
                self.locations.insert(id.clone(), location);
                Ok(PresenceChange::LocationChanged(id))
            }

            PresenceAction::SetTyping {
                participant_id,
                file_id,
                is_typing,
            } => {
                if !self.is_known(&participant_id) {
                    return Err(Ignored::UnknownParticipant);
                }
                let changed = if is_typing {
                    self.typing.insert(participant_id.clone(), file_id.clone()) != Some(file_id)
                } else if self.typing.get(&participant_id) == Some(&file_id) {
                    self.typing.remove(&participant_id);
                    true
                } else {
                    false
                };
                if !changed {
                    return Err(Ignored::Unchanged);
                }
                Ok(PresenceChange::TypingChanged(participant_id))
            }

            PresenceAction::Clear => {
                let removed: Vec<ParticipantId> = self.participants.keys().cloned().collect();
                self.participants.clear();
                let local_id = self.local.id.clone();
                self.locations.retain(|id, _| id == &local_id);
                self.typing.retain(|id, _| id == &local_id);
                Ok(PresenceChange::RosterChanged { removed })
            }
        }
    }

    /// Translate an inbound envelope into an action and apply it.
    ///
    /// `file_name` resolves display names for files whose envelope carries
    /// only an id.
    pub fn apply_remote<F>(&mut self, envelope: &Envelope, file_name: F) -> Result<PresenceChange, Ignored>
    where
        F: Fn(&FileId) -> Option<String>,
    {
        if self.is_local(&envelope.user_id) {
            return Err(Ignored::SelfEcho);
        }

        let action = match &envelope.payload {
            Payload::UserJoined { user } => PresenceAction::Upsert(Participant::from(user.clone())),
            Payload::UserLeft => PresenceAction::Remove(envelope.user_id.clone()),
            Payload::UsersList { users } => PresenceAction::ReplaceRoster(
                users.iter().cloned().map(Participant::from).collect(),
            ),
            Payload::CursorPosition {
                file_id,
                line,
                column,
            } => {
                let (line, column) = valid_position(*line, *column)?;
                let name = self
                    .locations
                    .get(&envelope.user_id)
                    .filter(|current| &current.file_id == file_id)
                    .map(|current| current.file_name.clone())
                    .or_else(|| file_name(file_id))
                    .unwrap_or_else(|| file_id.to_string());
                PresenceAction::SetLocation(self.location(envelope, file_id, name, line, column))
            }
            Payload::FileSelection { file_id, file_name: name } => {
                let name = if name.is_empty() {
                    file_name(file_id).unwrap_or_else(|| file_id.to_string())
                } else {
                    name.clone()
                };
                PresenceAction::SetLocation(self.location(envelope, file_id, name, 1, 1))
            }
            Payload::UserTyping { file_id, is_typing } => PresenceAction::SetTyping {
                participant_id: envelope.user_id.clone(),
                file_id: file_id.clone(),
                is_typing: *is_typing,
            },
            _ => return Err(Ignored::WrongKind),
        };

        self.apply(action)
    }

    fn location(
        &self,
        envelope: &Envelope,
        file_id: &FileId,
        file_name: String,
        line: u32,
        column: u32,
    ) -> PresenceLocation {
        let project_id = if envelope.project_id.is_empty() {
            self.project_id.clone()
        } else {
            envelope.project_id.clone()
        };
        PresenceLocation {
            participant_id: envelope.user_id.clone(),
            project_id,
            project_name: self.project_name.clone(),
            file_id: file_id.clone(),
            file_name,
            line,
            column,
            updated_at: envelope.timestamp,
        }
    }

    /// Location record for the local participant.
    pub fn local_location(
        &self,
        file_id: &FileId,
        file_name: &str,
        line: u32,
        column: u32,
        updated_at: i64,
    ) -> PresenceLocation {
        PresenceLocation {
            participant_id: self.local.id.clone(),
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            file_id: file_id.clone(),
            file_name: file_name.to_string(),
            line,
            column,
            updated_at,
        }
    }

    /// Look up a participant, self included.
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        if self.is_local(id) {
            return Some(&self.local);
        }
        self.participants.get(id)
    }

    /// Last accepted location of a participant.
    pub fn location_of(&self, id: &ParticipantId) -> Option<&PresenceLocation> {
        self.locations.get(id)
    }

    /// File a participant is currently typing in.
    pub fn typing_in(&self, id: &ParticipantId) -> Option<&FileId> {
        self.typing.get(id)
    }

    /// Remote participant count.
    pub fn remote_count(&self) -> usize {
        self.participants.len()
    }

    /// Self first, then remote participants in join order.
    pub fn snapshot(&self) -> Vec<RosterEntry> {
        std::iter::once((&self.local, true))
            .chain(self.participants.values().map(|p| (p, false)))
            .map(|(participant, is_self)| RosterEntry {
                participant: participant.clone(),
                location: self.locations.get(&participant.id).cloned(),
                is_self,
                typing_in: self.typing.get(&participant.id).cloned(),
            })
            .collect()
    }
}

/// Remote positions are 1-based; anything else is rejected.
pub(crate) fn valid_position(line: i64, column: i64) -> Result<(u32, u32), Ignored> {
    let line = u32::try_from(line).map_err(|_| Ignored::InvalidPosition)?;
    let column = u32::try_from(column).map_err(|_| Ignored::InvalidPosition)?;
    if line == 0 || column == 0 {
        return Err(Ignored::InvalidPosition);
    }
    Ok((line, column))
}
