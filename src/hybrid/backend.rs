use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::core::{ConversationFilter, ConversationState};
use crate::storage::{StorageCollaborator, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Database,
    File,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database => f.write_str("database"),
            Self::File => f.write_str("file"),
        }
    }
}

/// One place conversation state can live.
#[async_trait]
pub trait StateBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Unavailable backends are never chosen as primary.
    fn is_available(&self) -> bool {
        true
    }

    async fn save(&self, state: &ConversationState) -> Result<(), StorageError>;

    async fn load(&self, id: &str) -> Result<Option<ConversationState>, StorageError>;

    async fn remove(&self, id: &str) -> Result<bool, StorageError>;

    async fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Remove entries older than the retention window. Returns how many went.
    async fn cleanup_expired(&self, retention_days: u32) -> Result<u64, StorageError>;
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Conversation state stored through the storage collaborator.
pub struct DatabaseBackend {
    storage: Arc<dyn StorageCollaborator>,
}

impl DatabaseBackend {
    pub fn new(storage: Arc<dyn StorageCollaborator>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StateBackend for DatabaseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Database
    }

    fn is_available(&self) -> bool {
        self.storage.is_enabled()
    }

    async fn save(&self, state: &ConversationState) -> Result<(), StorageError> {
        self.storage.save_conversation(state).await.map(|_| ())
    }

    async fn load(&self, id: &str) -> Result<Option<ConversationState>, StorageError> {
        self.storage.get_conversation(id).await.map(|r| r.data)
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        self.storage.delete_conversation(id).await.map(|r| r.data)
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let response = self
            .storage
            .list_conversations(&ConversationFilter::default())
            .await?;
        Ok(response.data.into_iter().map(|s| s.id).collect())
    }

    async fn cleanup_expired(&self, retention_days: u32) -> Result<u64, StorageError> {
        self.storage
            .cleanup_old_data(retention_days)
            .await
            .map(|r| r.data)
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per conversation under `dir`.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StorageError> {
        let valid = !id.trim().is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StorageError::Validation(format!(
                "conversation id {id:?} is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read_state(path: &Path) -> Result<Option<ConversationState>, StorageError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn json_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn save(&self, state: &ConversationState) -> Result<(), StorageError> {
        let path = self.path_for(&state.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string_pretty(state)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ConversationState>, StorageError> {
        let path = self.path_for(id)?;
        Self::read_state(&path).await
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .json_files()
            .await?
            .iter()
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect())
    }

    async fn cleanup_expired(&self, retention_days: u32) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let mut removed = 0;
        for path in self.json_files().await? {
            let state = match Self::read_state(&path).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("skipping unreadable state file {}: {e}", path.display());
                    continue;
                }
            };
            if state.updated_at < cutoff {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
