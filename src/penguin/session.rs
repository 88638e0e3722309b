//! Session Store (C3).
//!
//! Grounded in `thought_chain.rs`'s JSONL append-only log, strengthened with
//! the atomic write protocol the spec demands: serialize to `*.temp`, fsync,
//! back up the current file as `*.bak`, rename `*.temp` onto the target, then
//! update the index. Readers fall back to `*.bak` if the primary file fails to
//! parse (evidence of a torn write).

use crate::penguin::error::PenguinError;
use crate::penguin::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// A named pointer into a session's message list, enabling rollback or
/// branching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub message_index: usize,
    pub checkpoint_type: CheckpointType,
    pub label: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Manual,
    Auto,
    Branch,
}

/// An ordered, append-only sequence of messages plus session metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub parent_session_id: Option<String>,
    pub owning_agent_id: String,
    pub messages: Vec<Message>,
    pub checkpoints: Vec<Checkpoint>,
}

impl Session {
    pub fn new(owning_agent_id: impl Into<String>) -> Self {
        Session {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            parent_session_id: None,
            owning_agent_id: owning_agent_id.into(),
            messages: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Appends a message, enforcing the non-decreasing-timestamp invariant by
    /// construction (the store never rewrites a message's timestamp, it just
    /// refuses out-of-order inserts at the API boundary in
    /// [`crate::penguin::conversation::ConversationManager`]).
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn create_checkpoint(&mut self, checkpoint_type: CheckpointType, label: Option<String>) -> String {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: self.id.clone(),
            message_index: self.messages.len(),
            checkpoint_type,
            label,
            timestamp: Utc::now(),
        };
        let id = checkpoint.id.clone();
        self.checkpoints.push(checkpoint);
        id
    }

    /// Rolls this session back to `checkpoint_id` in place, truncating the
    /// message list to the checkpoint's recorded index.
    pub fn rollback_to_checkpoint(&mut self, checkpoint_id: &str) -> bool {
        if let Some(checkpoint) = self.checkpoints.iter().find(|c| c.id == checkpoint_id) {
            let index = checkpoint.message_index;
            self.messages.truncate(index);
            true
        } else {
            false
        }
    }

    /// Produces a new session whose message list is the prefix up to
    /// `checkpoint_id`, with `parent_session_id` pointing at `self`.
    pub fn branch_from_checkpoint(&self, checkpoint_id: &str) -> Option<Session> {
        let checkpoint = self.checkpoints.iter().find(|c| c.id == checkpoint_id)?;
        let mut branch = Session::new(self.owning_agent_id.clone());
        branch.parent_session_id = Some(self.id.clone());
        branch.messages = self.messages[..checkpoint.message_index].to_vec();
        Some(branch)
    }

    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for message in &self.messages {
            hasher.update(message.id.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    session_id: String,
    path: PathBuf,
    parent_session_id: Option<String>,
    digest: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    entries: HashMap<String, IndexEntry>,
}

/// Append-only on-disk store for [`Session`]s, with an index mapping
/// `session_id -> path, metadata, parent, checkpoints` and an atomic write
/// protocol that never leaves a torn file as the sole copy on disk.
pub struct SessionStore {
    root: PathBuf,
    index: Mutex<Index>,
    /// Per-session write locks. Cross-session writes proceed in parallel;
    /// writes to the same session are serialized.
    write_locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PenguinError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| PenguinError::Persistence(format!("cannot create {}: {e}", root.display())))?;
        let index_path = root.join("session_index.json");
        let index = if index_path.exists() {
            let contents = fs::read_to_string(&index_path)
                .map_err(|e| PenguinError::Persistence(e.to_string()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            Index::default()
        };
        Ok(SessionStore {
            root,
            index: Mutex::new(index),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, session_id: &str) -> std::sync::Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl.json"))
    }

    /// Atomic write protocol: serialize to `*.temp`, fsync, back up the
    /// existing target as `*.bak`, rename `*.temp -> target`, then update the
    /// index. On success the on-disk file is always a valid prefix of the
    /// in-memory state at save time (trivially true here since we serialize
    /// the whole session, not an incremental diff).
    pub fn save(&self, session: &Session) -> Result<(), PenguinError> {
        let lock = self.lock_for(&session.id);
        let _guard = lock.lock().unwrap();

        let target = self.path_for(&session.id);
        let temp_path = target.with_extension("temp");
        let backup_path = target.with_extension("bak");

        let serialized = serde_json::to_vec_pretty(session)
            .map_err(|e| PenguinError::Persistence(e.to_string()))?;

        {
            let mut file = fs::File::create(&temp_path)
                .map_err(|e| PenguinError::Persistence(e.to_string()))?;
            file.write_all(&serialized)
                .map_err(|e| PenguinError::Persistence(e.to_string()))?;
            file.sync_all()
                .map_err(|e| PenguinError::Persistence(e.to_string()))?;
        }

        if target.exists() {
            fs::copy(&target, &backup_path)
                .map_err(|e| PenguinError::Persistence(e.to_string()))?;
        }

        fs::rename(&temp_path, &target)
            .map_err(|e| PenguinError::Persistence(e.to_string()))?;

        let mut index = self.index.lock().unwrap();
        index.entries.insert(
            session.id.clone(),
            IndexEntry {
                session_id: session.id.clone(),
                path: target.clone(),
                parent_session_id: session.parent_session_id.clone(),
                digest: session.digest(),
            },
        );
        let index_path = self.root.join("session_index.json");
        let index_json = serde_json::to_vec_pretty(&*index)
            .map_err(|e| PenguinError::Persistence(e.to_string()))?;
        fs::write(&index_path, index_json).map_err(|e| PenguinError::Persistence(e.to_string()))?;

        Ok(())
    }

    /// Loads a session, falling back to the `.bak` copy if the primary file
    /// is missing or fails to parse (evidence of a partial write).
    pub fn load(&self, session_id: &str) -> Result<Session, PenguinError> {
        let target = self.path_for(session_id);
        if let Ok(session) = self.try_read(&target) {
            return Ok(session);
        }
        let backup_path = target.with_extension("bak");
        self.try_read(&backup_path)
            .map_err(|_| PenguinError::Persistence(format!("no readable copy of session {session_id}")))
    }

    fn try_read(&self, path: &Path) -> Result<Session, PenguinError> {
        let contents = fs::read_to_string(path).map_err(|e| PenguinError::Persistence(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| PenguinError::Persistence(e.to_string()))
    }

    /// Deletes a session. Without `force`, refuses if other sessions record it
    /// as their `parent_session_id` (a live sub-agent/branch reference).
    pub fn delete_session(&self, session_id: &str, force: bool) -> Result<(), PenguinError> {
        let index = self.index.lock().unwrap();
        let has_dependents = index
            .entries
            .values()
            .any(|e| e.parent_session_id.as_deref() == Some(session_id));
        if has_dependents && !force {
            return Err(PenguinError::Persistence(format!(
                "session {session_id} has dependents; pass force=true to delete anyway"
            )));
        }
        drop(index);

        let target = self.path_for(session_id);
        let _ = fs::remove_file(&target);
        let _ = fs::remove_file(target.with_extension("bak"));

        let mut index = self.index.lock().unwrap();
        index.entries.remove(session_id);
        Ok(())
    }
}
