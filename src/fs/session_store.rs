//! On-disk session snapshots.
//!
//! Layout: `<root>/<session-id>/session.json`, with the root defaulting to
//! `~/.warp/sessions`. Saves are atomic with respect to process crash: the
//! snapshot is written to a temp file in the same directory and renamed
//! over the previous one, so a reader never observes a partial write. The
//! coordinator is the single writer; external reporters only read.

use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::EngineError;
use crate::fs::locking::locked_read;
use crate::models::session::{SessionState, SNAPSHOT_VERSION};

pub const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Store under the default root, `~/.warp/sessions`.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::open(home.join(".warp").join("sessions")))
    }

    /// Store under an explicit root. Tests point this at a temp dir.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(SESSION_FILE_NAME)
    }

    /// Persist a snapshot atomically. Any failure is a
    /// [`EngineError::Persistence`]: continuing past a failed save would
    /// risk silent loss of completed work on resume.
    pub fn save(&self, state: &mut SessionState) -> Result<(), EngineError> {
        state.updated_at = Utc::now();

        let dir = self.root.join(&state.id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::persistence(format!("failed to create {}: {e}", dir.display()))
        })?;

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::persistence(format!("failed to serialize session: {e}")))?;

        // Temp file in the target directory so the rename stays on one
        // filesystem.
        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| {
            EngineError::persistence(format!("failed to create temp file in {}: {e}", dir.display()))
        })?;
        temp.write_all(json.as_bytes())
            .and_then(|_| temp.flush())
            .map_err(|e| EngineError::persistence(format!("failed to write snapshot: {e}")))?;

        let path = dir.join(SESSION_FILE_NAME);
        temp.persist(&path).map_err(|e| {
            EngineError::persistence(format!("failed to replace {}: {e}", path.display()))
        })?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<SessionState, EngineError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(EngineError::persistence(format!("session '{id}' not found")));
        }
        let content = locked_read(&path)
            .map_err(|e| EngineError::persistence(format!("failed to read snapshot: {e:#}")))?;
        let state: SessionState = serde_json::from_str(&content).map_err(|e| {
            EngineError::persistence(format!("corrupt snapshot {}: {e}", path.display()))
        })?;
        if state.version > SNAPSHOT_VERSION {
            return Err(EngineError::persistence(format!(
                "snapshot version {} is newer than supported version {}",
                state.version, SNAPSHOT_VERSION
            )));
        }
        Ok(state)
    }

    /// All readable sessions, most recently updated first. Unreadable
    /// entries are skipped rather than failing the listing.
    pub fn list(&self) -> Vec<SessionState> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionState> = entries
            .flatten()
            .filter_map(|entry| {
                let id = entry.file_name().into_string().ok()?;
                self.load(&id).ok()
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }
}
