//! Time-bounded exclusive file locks keyed by (project, path).
//!
//! Locks are coarse-grained advisory claims taken by an agent while it edits
//! a file on behalf of a bead. An expired lock is treated as absent: the
//! next `acquire` succeeds and overwrites it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::FileLock;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FileLockError {
    #[error("already locked: {path} held by {holder} for bead {bead}")]
    AlreadyLocked {
        path: String,
        holder: String,
        bead: String,
    },
    #[error("lock not found: {project}:{path}")]
    NotFound { project: String, path: String },
    #[error("not the holder: {path} is held by {holder}, not {caller}")]
    NotHolder {
        path: String,
        holder: String,
        caller: String,
    },
}

pub type Result<T> = std::result::Result<T, FileLockError>;

// ---------------------------------------------------------------------------
// FileLockManager
// ---------------------------------------------------------------------------

/// Exclusive (project, path) locks behind a single mutex.
///
/// Contention is acceptable here: locks are taken around whole-file edits,
/// not hot paths.
pub struct FileLockManager {
    locks: Mutex<HashMap<(String, String), FileLock>>,
    default_timeout: Duration,
}

impl FileLockManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Acquire a lock for `agent_id` working `bead_id`.
    ///
    /// Fails with [`FileLockError::AlreadyLocked`] when a live lock exists;
    /// an expired lock is overwritten.
    pub fn acquire(
        &self,
        project_id: &str,
        path: &str,
        agent_id: &str,
        bead_id: &str,
    ) -> Result<FileLock> {
        let now = Utc::now();
        let key = (project_id.to_string(), path.to_string());
        let mut locks = self.locks.lock().expect("file lock map poisoned");

        if let Some(existing) = locks.get(&key) {
            if !existing.is_expired(now) {
                return Err(FileLockError::AlreadyLocked {
                    path: path.to_string(),
                    holder: existing.agent_id.clone(),
                    bead: existing.bead_id.clone(),
                });
            }
            debug!(project = %project_id, path = %path, "overwriting expired lock");
        }

        let lock = FileLock {
            project_id: project_id.to_string(),
            path: path.to_string(),
            agent_id: agent_id.to_string(),
            bead_id: bead_id.to_string(),
            locked_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.default_timeout)
                    .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        };
        locks.insert(key, lock.clone());
        debug!(project = %project_id, path = %path, agent = %agent_id, "lock acquired");
        Ok(lock)
    }

    /// Release a lock. The caller must be the holder.
    pub fn release(&self, project_id: &str, path: &str, agent_id: &str) -> Result<()> {
        let key = (project_id.to_string(), path.to_string());
        let mut locks = self.locks.lock().expect("file lock map poisoned");

        match locks.get(&key) {
            None => Err(FileLockError::NotFound {
                project: project_id.to_string(),
                path: path.to_string(),
            }),
            Some(lock) if lock.agent_id != agent_id => Err(FileLockError::NotHolder {
                path: path.to_string(),
                holder: lock.agent_id.clone(),
                caller: agent_id.to_string(),
            }),
            Some(_) => {
                locks.remove(&key);
                debug!(project = %project_id, path = %path, agent = %agent_id, "lock released");
                Ok(())
            }
        }
    }

    /// Returns `true` if a live (non-expired) lock exists.
    pub fn is_locked(&self, project_id: &str, path: &str) -> bool {
        self.get(project_id, path).is_some()
    }

    /// Get the live lock for (project, path), if any.
    pub fn get(&self, project_id: &str, path: &str) -> Option<FileLock> {
        let now = Utc::now();
        let key = (project_id.to_string(), path.to_string());
        let locks = self.locks.lock().expect("file lock map poisoned");
        locks.get(&key).filter(|l| !l.is_expired(now)).cloned()
    }

    /// All live locks.
    pub fn list(&self) -> Vec<FileLock> {
        let now = Utc::now();
        let locks = self.locks.lock().expect("file lock map poisoned");
        locks
            .values()
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn list_by_project(&self, project_id: &str) -> Vec<FileLock> {
        self.list()
            .into_iter()
            .filter(|l| l.project_id == project_id)
            .collect()
    }

    pub fn list_by_agent(&self, agent_id: &str) -> Vec<FileLock> {
        self.list()
            .into_iter()
            .filter(|l| l.agent_id == agent_id)
            .collect()
    }

    /// Drop every lock held by `agent_id`. Returns the number released.
    pub fn release_agent_locks(&self, agent_id: &str) -> usize {
        let mut locks = self.locks.lock().expect("file lock map poisoned");
        let before = locks.len();
        locks.retain(|_, l| l.agent_id != agent_id);
        let released = before - locks.len();
        if released > 0 {
            info!(agent = %agent_id, released, "released agent locks");
        }
        released
    }

    /// Remove expired locks from the map. Returns the number cleaned.
    pub fn clean_expired(&self) -> usize {
        let now = Utc::now();
        let mut locks = self.locks.lock().expect("file lock map poisoned");
        let before = locks.len();
        locks.retain(|_, l| !l.is_expired(now));
        before - locks.len()
    }

    /// Extend a held lock by `extra`. The caller must be the holder.
    pub fn extend(
        &self,
        project_id: &str,
        path: &str,
        agent_id: &str,
        extra: Duration,
    ) -> Result<FileLock> {
        let key = (project_id.to_string(), path.to_string());
        let mut locks = self.locks.lock().expect("file lock map poisoned");

        match locks.get_mut(&key) {
            None => Err(FileLockError::NotFound {
                project: project_id.to_string(),
                path: path.to_string(),
            }),
            Some(lock) if lock.agent_id != agent_id => Err(FileLockError::NotHolder {
                path: path.to_string(),
                holder: lock.agent_id.clone(),
                caller: agent_id.to_string(),
            }),
            Some(lock) => {
                lock.expires_at += chrono::Duration::from_std(extra)
                    .unwrap_or_else(|_| chrono::Duration::minutes(10));
                Ok(lock.clone())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
