//! File-content store seam.
//!
//! The session reads file content when a tab opens and writes it on save.
//! Persistence itself lives outside this crate; [`MemoryFileStore`] backs
//! tests and local demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::protocol::FileId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(FileId),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Reads and persists file content by id.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, file_id: &FileId) -> Result<String, StoreError>;

    async fn write(&self, file_id: &FileId, content: &str) -> Result<(), StoreError>;
}

/// In-memory store. Writes can be made to fail for error-path tests.
#[derive(Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<FileId, String>>,
    fail_writes: AtomicBool,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `(file id, content)` pairs.
    pub fn with_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<FileId>,
        V: Into<String>,
    {
        Self {
            files: RwLock::new(
                files
                    .into_iter()
                    .map(|(id, content)| (id.into(), content.into()))
                    .collect(),
            ),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Stored content, without going through the trait.
    pub async fn get(&self, file_id: &FileId) -> Option<String> {
        self.files.read().await.get(file_id).cloned()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read(&self, file_id: &FileId) -> Result<String, StoreError> {
        self.files
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(file_id.clone()))
    }

    async fn write(&self, file_id: &FileId, content: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Backend("writes disabled".to_string()));
        }
        self.files
            .write()
            .await
            .insert(file_id.clone(), content.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_missing_file() {
        let store = MemoryFileStore::new();
        let id = FileId::from("nope.rs");
        assert_eq!(store.read(&id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryFileStore::with_files([("a.js", "old")]);
        let id = FileId::from("a.js");
        store.write(&id, "new").await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryFileStore::with_files([("a.js", "old")]);
        store.set_fail_writes(true);
        let id = FileId::from("a.js");
        assert!(matches!(
            store.write(&id, "new").await,
            Err(StoreError::Backend(_))
        ));
        assert_eq!(store.get(&id).await.as_deref(), Some("old"));
    }
}
