//! Client-local markers for conversations the user cleared.
//!
//! A marker suppresses re-showing history after an explicit clear until
//! the next successful history fetch consumes it. Markers persist as a
//! JSON array of conversation ids.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parley_proto::message::ConversationId;

/// Errors reading or writing the marker file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The file could not be read or written.
    #[error("marker file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file exists but is not a JSON array of ids.
    #[error("marker file {path} is corrupt: {source}")]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// Parse error.
        source: serde_json::Error,
    },
}

/// Set of cleared conversations, mirrored to disk on every change.
#[derive(Debug)]
pub struct ClearedMarkers {
    path: Option<PathBuf>,
    cleared: BTreeSet<ConversationId>,
}

impl ClearedMarkers {
    /// Markers that are never persisted.
    #[must_use]
    pub const fn in_memory() -> Self {
        Self {
            path: None,
            cleared: BTreeSet::new(),
        }
    }

    /// Load markers from `path`. A missing file is an empty set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file exists but cannot be read or
    /// parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cleared = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path: Some(path),
            cleared,
        })
    }

    /// Whether `conversation` was cleared.
    #[must_use]
    pub fn contains(&self, conversation: &ConversationId) -> bool {
        self.cleared.contains(conversation)
    }

    /// Mark `conversation` cleared.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file could not be written; the
    /// in-memory set is updated regardless.
    pub fn insert(&mut self, conversation: ConversationId) -> Result<(), StoreError> {
        if self.cleared.insert(conversation) {
            self.persist()?;
        }
        Ok(())
    }

    /// Consume the marker of `conversation`. Returns whether one was set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file could not be written.
    pub fn remove(&mut self, conversation: &ConversationId) -> Result<bool, StoreError> {
        if !self.cleared.remove(conversation) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let body = serde_json::to_string(&self.cleared).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(path, &body).map_err(io_err)
    }
}

/// Write through a sibling temp file so a crash never leaves half a file.
fn write_atomic(path: &Path, body: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}
