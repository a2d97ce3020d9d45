//! Session Store (spec §3 Session, §6 persisted state): an append-only
//! per-session JSONL message log, one file per session under the
//! configured data directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::types::{ChannelSessionKey, Session, SessionMessage};

/// Errors raised by the Session Store.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session log file could not be written.
    #[error("failed to write session log for {session_id}: {source}")]
    Write {
        /// Session whose log failed to write.
        session_id: Uuid,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The session log file could not be read back.
    #[error("failed to read session log for {session_id}: {source}")]
    Read {
        /// Session whose log failed to read.
        session_id: Uuid,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// No session exists under this id.
    #[error("session {0} not found")]
    NotFound(Uuid),
}

/// Owns the one-session-per-key mapping and the append-only JSONL logs.
#[derive(Clone)]
pub struct SessionStore {
    data_dir: PathBuf,
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    by_key: Arc<RwLock<HashMap<ChannelSessionKey, Uuid>>>,
    write_locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl SessionStore {
    /// Build a store writing session logs under `data_dir/sessions/`.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            by_key: Arc::new(RwLock::new(HashMap::new())),
            write_locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the existing session for `key`, or create a new one (spec §3:
    /// a session is owned by exactly one channel-session key).
    pub async fn get_or_create(&self, key: &ChannelSessionKey) -> Session {
        if let Some(session_id) = self.by_key.read().await.get(key).copied() {
            if let Some(session) = self.sessions.read().await.get(&session_id).cloned() {
                return session;
            }
        }

        let session = Session {
            session_id: Uuid::new_v4(),
            key: key.clone(),
            created_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .insert(session.session_id, session.clone());
        self.by_key.write().await.insert(key.clone(), session.session_id);
        session
    }

    /// Look up a session by id.
    pub async fn get(&self, session_id: Uuid) -> Result<Session, SessionError> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Append one message to a session's log. Concurrent appends to the
    /// same session serialize through a per-session lock; different
    /// sessions append independently.
    pub async fn append(
        &self,
        session_id: Uuid,
        message: SessionMessage,
    ) -> Result<(), SessionError> {
        if self.sessions.read().await.get(&session_id).is_none() {
            return Err(SessionError::NotFound(session_id));
        }

        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let path = self.log_path(session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SessionError::Write { session_id, source })?;
        }

        let mut line = serde_json::to_string(&message).unwrap_or_default();
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| SessionError::Write { session_id, source })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| SessionError::Write { session_id, source })?;
        Ok(())
    }

    /// Read back every message in a session's log, in append order.
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<SessionMessage>, SessionError> {
        let path = self.log_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SessionError::Read { session_id, source })?;
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    fn log_path(&self, session_id: Uuid) -> PathBuf {
        self.data_dir.join("sessions").join(format!("{session_id}.jsonl"))
    }

    async fn lock_for(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.write_locks.read().await.get(&session_id) {
            return lock.clone();
        }
        let mut locks = self.write_locks.write().await;
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Reference to an existing session's log directory, used by CLI
/// subcommands that inspect a session without the full store (e.g. status
/// reporting).
pub fn session_log_path(data_dir: &Path, session_id: Uuid) -> PathBuf {
    data_dir.join("sessions").join(format!("{session_id}.jsonl"))
}
