//! Open file buffers (editor tabs).
//!
//! Buffers are created and destroyed only by UI commands. Remote edits and
//! saves may overwrite content and sync bookkeeping, never open or close.

use indexmap::IndexMap;

use crate::error::Ignored;
use crate::protocol::FileId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBuffer {
    pub file_id: FileId,
    pub file_name: String,
    pub content: String,
    /// Content as of the last save or accepted remote sync.
    pub last_synced_content: String,
    pub unsaved: bool,
}

impl OpenBuffer {
    /// A freshly loaded buffer: synced and saved.
    pub fn new(file_id: FileId, file_name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            file_id,
            file_name: file_name.into(),
            last_synced_content: content.clone(),
            content,
            unsaved: false,
        }
    }

    fn refresh_unsaved(&mut self) {
        self.unsaved = self.content != self.last_synced_content;
    }
}

/// Tab table in open order, plus the active tab.
#[derive(Debug, Default)]
pub struct OpenBuffers {
    buffers: IndexMap<FileId, OpenBuffer>,
    active: Option<FileId>,
}

impl OpenBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or re-focus) a tab and make it active.
    ///
    /// Reopening an open file keeps its current buffer untouched.
    pub fn open(&mut self, buffer: OpenBuffer) -> &OpenBuffer {
        let file_id = buffer.file_id.clone();
        self.active = Some(file_id.clone());
        self.buffers.entry(file_id).or_insert(buffer)
    }

    /// Close a tab. The most recently opened remaining tab becomes active.
    pub fn close(&mut self, file_id: &FileId) -> Option<OpenBuffer> {
        let closed = self.buffers.shift_remove(file_id)?;
        if self.active.as_ref() == Some(file_id) {
            self.active = self.buffers.keys().last().cloned();
        }
        Some(closed)
    }

    /// Make an open tab active.
    pub fn activate(&mut self, file_id: &FileId) -> Result<(), Ignored> {
        if !self.buffers.contains_key(file_id) {
            return Err(Ignored::FileNotOpen);
        }
        if self.active.as_ref() == Some(file_id) {
            return Err(Ignored::Unchanged);
        }
        self.active = Some(file_id.clone());
        Ok(())
    }

    /// Id of the active tab.
    pub fn active_id(&self) -> Option<&FileId> {
        self.active.as_ref()
    }

    /// The active tab's buffer.
    pub fn active(&self) -> Option<&OpenBuffer> {
        self.active.as_ref().and_then(|id| self.buffers.get(id))
    }

    pub fn is_active(&self, file_id: &FileId) -> bool {
        self.active.as_ref() == Some(file_id)
    }

    /// Get an open buffer by file id.
    pub fn get(&self, file_id: &FileId) -> Option<&OpenBuffer> {
        self.buffers.get(file_id)
    }

    /// Whether a tab is open for `file_id`.
    pub fn is_open(&self, file_id: &FileId) -> bool {
        self.buffers.contains_key(file_id)
    }

    /// Display name of an open file.
    pub fn file_name(&self, file_id: &FileId) -> Option<&str> {
        self.buffers.get(file_id).map(|b| b.file_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Open buffers in the order their tabs were opened.
    pub fn iter(&self) -> impl Iterator<Item = &OpenBuffer> {
        self.buffers.values()
    }

    /// A keystroke-level edit from the local editor.
    pub fn local_edit(&mut self, file_id: &FileId, content: String) -> Result<(), Ignored> {
        let buffer = self.buffers.get_mut(file_id).ok_or(Ignored::FileNotOpen)?;
        if buffer.content == content {
            return Err(Ignored::Unchanged);
        }
        buffer.content = content;
        buffer.refresh_unsaved();
        Ok(())
    }

    /// Remote full-content replace. Returns whether the file is active.
    ///
    /// Only the active buffer advances its sync point; the visible editor is
    /// what the user has now seen.
    pub fn apply_remote_content(&mut self, file_id: &FileId, content: &str) -> Result<bool, Ignored> {
        let is_active = self.is_active(file_id);
        let buffer = self.buffers.get_mut(file_id).ok_or(Ignored::FileNotOpen)?;
        let synced_current = !is_active || buffer.last_synced_content == content;
        if buffer.content == content && synced_current {
            return Err(Ignored::Unchanged);
        }
        buffer.content = content.to_string();
        if is_active {
            buffer.last_synced_content = content.to_string();
        }
        buffer.refresh_unsaved();
        Ok(is_active)
    }

    /// Remote save: unconditional overwrite, unsaved cleared.
    pub fn apply_saved(&mut self, file_id: &FileId, content: &str) -> Result<bool, Ignored> {
        let is_active = self.is_active(file_id);
        let buffer = self.buffers.get_mut(file_id).ok_or(Ignored::FileNotOpen)?;
        buffer.content = content.to_string();
        buffer.last_synced_content = content.to_string();
        buffer.unsaved = false;
        Ok(is_active)
    }

    /// Local save succeeded.
    pub fn mark_saved(&mut self, file_id: &FileId) -> Result<&OpenBuffer, Ignored> {
        let buffer = self.buffers.get_mut(file_id).ok_or(Ignored::FileNotOpen)?;
        buffer.last_synced_content = buffer.content.clone();
        buffer.unsaved = false;
        Ok(buffer)
    }
}
