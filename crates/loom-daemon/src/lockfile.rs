//! Single-instance daemon lockfile.
//!
//! On startup the daemon writes a JSON lockfile under its base directory.
//! `acquire` uses `O_CREAT | O_EXCL` so two racing daemons have exactly one
//! winner; the loser inspects the holder's PID and either reports the live
//! instance or removes the stale file and retries.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const LOCKFILE_NAME: &str = "loomd.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub started_at: String,
    pub base_dir: PathBuf,
    pub version: String,
}

/// Result of trying to acquire the lockfile.
pub enum AcquireResult {
    /// We created the lockfile and own it.
    Acquired,
    /// Another live daemon holds the lockfile.
    AlreadyRunning(DaemonLockfile),
    /// A stale lockfile was removed; the caller may retry.
    StaleRemoved,
}

impl DaemonLockfile {
    pub fn for_current_process(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now().to_rfc3339(),
            base_dir: base_dir.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn path_in(base_dir: &Path) -> PathBuf {
        base_dir.join(LOCKFILE_NAME)
    }

    /// Try to exclusively create and write the lockfile at `path`.
    pub fn acquire(&self, path: &Path) -> std::io::Result<AcquireResult> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL, fails if the file exists
            .open(path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::read(path) {
                    Some(existing) if existing.is_alive() => {
                        Ok(AcquireResult::AlreadyRunning(existing))
                    }
                    _ => {
                        tracing::info!(path = %path.display(), "removing stale daemon lockfile");
                        Self::remove(path);
                        Ok(AcquireResult::StaleRemoved)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Acquire with one automatic retry after stale cleanup. `Ok` means we
    /// own the lockfile.
    pub fn acquire_or_fail(&self, path: &Path) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire(path) {
                Ok(AcquireResult::Acquired) => return Ok(()),
                Ok(AcquireResult::AlreadyRunning(existing)) => {
                    return Err(format!(
                        "daemon already running (pid={}, started={})",
                        existing.pid, existing.started_at
                    ));
                }
                Ok(AcquireResult::StaleRemoved) if attempt == 0 => continue,
                Ok(AcquireResult::StaleRemoved) => {
                    return Err("failed to acquire lockfile after stale cleanup".into());
                }
                Err(e) => return Err(format!("lockfile I/O error: {e}")),
            }
        }
        Err("lockfile acquire failed".into())
    }

    /// Read the lockfile. `None` if missing or unparseable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove(path: &Path) {
        let _ = std::fs::remove_file(path);
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 checks existence without delivering a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        assert!(!pid_alive(4_000_000));
    }

    #[test]
    fn second_acquire_reports_running_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = DaemonLockfile::path_in(dir.path());
        let lock = DaemonLockfile::for_current_process(dir.path());

        lock.acquire_or_fail(&path).unwrap();
        let err = lock.acquire_or_fail(&path).unwrap_err();
        assert!(err.contains("already running"));
    }

    #[test]
    fn stale_lockfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = DaemonLockfile::path_in(dir.path());
        let stale = DaemonLockfile {
            pid: 4_000_000,
            started_at: Utc::now().to_rfc3339(),
            base_dir: dir.path().to_path_buf(),
            version: "0.0.0".into(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = DaemonLockfile::for_current_process(dir.path());
        lock.acquire_or_fail(&path).unwrap();
        assert_eq!(DaemonLockfile::read(&path).unwrap().pid, std::process::id());
    }

    #[test]
    fn corrupt_lockfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = DaemonLockfile::path_in(dir.path());
        std::fs::write(&path, "not json").unwrap();

        let lock = DaemonLockfile::for_current_process(dir.path());
        lock.acquire_or_fail(&path).unwrap();
    }
}
