//! Cursor synchronizer: participant → position-in-file, plus the editor
//! decorations derived from it.
//!
//! Every successful [`CursorSynchronizer::apply`] recomputes the cached
//! decoration list, so consumers only ever read a consistent set.

use std::collections::HashMap;

use crate::error::Ignored;
use crate::presence::{valid_position, ColorHint};
use crate::protocol::{Envelope, FileId, ParticipantId, Payload};

/// What produced a local cursor movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorSource {
    PositionChanged,
    SelectionChanged,
    PointerClick,
    /// Periodic fallback read of the editor position.
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub file_id: FileId,
    pub line: u32,
    pub column: u32,
    pub updated_at: i64,
}

impl CursorState {
    fn same_place(&self, file_id: &FileId, line: u32, column: u32) -> bool {
        &self.file_id == file_id && self.line == line && self.column == column
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecorationKind {
    /// Whole-line highlight.
    Line,
    /// One-character marker at the exact column.
    Caret,
}

/// 1-based editor range, end column exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecorationRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoration {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub color: ColorHint,
    pub is_self: bool,
    pub kind: DecorationKind,
    pub range: DecorationRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CursorAction {
    Move(CursorState),
    Remove(ParticipantId),
    /// Keep only these participants (and self).
    Retain(Vec<ParticipantId>),
    /// Drop every remote cursor.
    ClearRemote,
    /// The editor switched to another file (or none).
    Activate(Option<FileId>),
}

/// Decorations for every participant located in `active_file`, ordered by
/// participant id. Pure: equal inputs give equal output.
pub fn compute_decorations(
    cursors: &HashMap<ParticipantId, CursorState>,
    active_file: Option<&FileId>,
    local_id: &ParticipantId,
) -> Vec<Decoration> {
    let Some(active_file) = active_file else {
        return Vec::new();
    };

    let mut located: Vec<&CursorState> = cursors
        .values()
        .filter(|c| &c.file_id == active_file && c.line > 0 && c.column > 0)
        .collect();
    located.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

    located
        .into_iter()
        .flat_map(|cursor| {
            let color = ColorHint::for_participant(&cursor.participant_id);
            let is_self = &cursor.participant_id == local_id;
            let line = DecorationRange {
                start_line: cursor.line,
                start_column: 1,
                end_line: cursor.line,
                end_column: u32::MAX,
            };
            let caret = DecorationRange {
                start_line: cursor.line,
                start_column: cursor.column,
                end_line: cursor.line,
                end_column: cursor.column.saturating_add(1),
            };
            [(DecorationKind::Line, line), (DecorationKind::Caret, caret)]
                .into_iter()
                .map(move |(kind, range)| Decoration {
                    participant_id: cursor.participant_id.clone(),
                    display_name: cursor.display_name.clone(),
                    color,
                    is_self,
                    kind,
                    range,
                })
        })
        .collect()
}

pub struct CursorSynchronizer {
    local_id: ParticipantId,
    local_name: String,
    cursors: HashMap<ParticipantId, CursorState>,
    active_file: Option<FileId>,
    decorations: Vec<Decoration>,
}

impl CursorSynchronizer {
    /// Create a synchronizer with no cursors and no active file.
    pub fn new(local_id: ParticipantId, local_name: impl Into<String>) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            cursors: HashMap::new(),
            active_file: None,
            decorations: Vec::new(),
        }
    }

    /// Apply one mutation. `Ok(true)` means the decoration set changed.
    pub fn apply(&mut self, action: CursorAction) -> Result<bool, Ignored> {
        match action {
            CursorAction::Move(state) => {
                if let Some(current) = self.cursors.get(&state.participant_id) {
                    if state.updated_at <= current.updated_at {
                        return Err(Ignored::Stale);
                    }
                }
                self.cursors.insert(state.participant_id.clone(), state);
            }
            CursorAction::Remove(id) => {
                if self.cursors.remove(&id).is_none() {
                    return Err(Ignored::UnknownParticipant);
                }
            }
            CursorAction::Retain(keep) => {
                let local_id = self.local_id.clone();
                let before = self.cursors.len();
                self.cursors
                    .retain(|id, _| id == &local_id || keep.contains(id));
                if self.cursors.len() == before {
                    return Err(Ignored::Unchanged);
                }
            }
            CursorAction::ClearRemote => {
                let local_id = self.local_id.clone();
                self.cursors.retain(|id, _| id == &local_id);
            }
            CursorAction::Activate(file_id) => {
                if self.active_file == file_id {
                    return Err(Ignored::Unchanged);
                }
                self.active_file = file_id;
            }
        }
        Ok(self.recompute())
    }

    fn recompute(&mut self) -> bool {
        let next = compute_decorations(&self.cursors, self.active_file.as_ref(), &self.local_id);
        if next == self.decorations {
            return false;
        }
        self.decorations = next;
        true
    }

    /// Local movement: update own state and return the payload to broadcast.
    ///
    /// Poll-sourced positions equal to the current one are absorbed.
    pub fn move_local(
        &mut self,
        file_id: &FileId,
        line: u32,
        column: u32,
        source: CursorSource,
        updated_at: i64,
    ) -> Result<Payload, Ignored> {
        if line == 0 || column == 0 {
            return Err(Ignored::InvalidPosition);
        }
        if source == CursorSource::Poll
            && self
                .local()
                .is_some_and(|current| current.same_place(file_id, line, column))
        {
            return Err(Ignored::Unchanged);
        }

        self.apply(CursorAction::Move(CursorState {
            participant_id: self.local_id.clone(),
            display_name: self.local_name.clone(),
            file_id: file_id.clone(),
            line,
            column,
            updated_at,
        }))?;

        Ok(Payload::CursorPosition {
            file_id: file_id.clone(),
            line: i64::from(line),
            column: i64::from(column),
        })
    }

    /// Apply an inbound cursor envelope. `Ok(true)` means decorations changed.
    pub fn apply_remote(&mut self, envelope: &Envelope) -> Result<bool, Ignored> {
        if envelope.is_from(&self.local_id) {
            return Err(Ignored::SelfEcho);
        }
        match &envelope.payload {
            Payload::CursorPosition {
                file_id,
                line,
                column,
            } => {
                let (line, column) = valid_position(*line, *column)?;
                let display_name = if envelope.user_name.is_empty() {
                    self.cursors
                        .get(&envelope.user_id)
                        .map(|c| c.display_name.clone())
                        .unwrap_or_else(|| "Anonymous".to_string())
                } else {
                    envelope.user_name.clone()
                };
                self.apply(CursorAction::Move(CursorState {
                    participant_id: envelope.user_id.clone(),
                    display_name,
                    file_id: file_id.clone(),
                    line,
                    column,
                    updated_at: envelope.timestamp,
                }))
            }
            Payload::UserLeft => self.apply(CursorAction::Remove(envelope.user_id.clone())),
            _ => Err(Ignored::WrongKind),
        }
    }

    /// Our own cursor, once it has moved.
    pub fn local(&self) -> Option<&CursorState> {
        self.cursors.get(&self.local_id)
    }

    /// Cursor of one participant.
    pub fn cursor(&self, id: &ParticipantId) -> Option<&CursorState> {
        self.cursors.get(id)
    }

    pub fn cursors(&self) -> &HashMap<ParticipantId, CursorState> {
        &self.cursors
    }

    /// File the decorations are computed for.
    pub fn active_file(&self) -> Option<&FileId> {
        self.active_file.as_ref()
    }

    /// Decorations for the active file, as last computed.
    pub fn decorations(&self) -> &[Decoration] {
        &self.decorations
    }
}
