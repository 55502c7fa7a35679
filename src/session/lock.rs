//! Connection Lock
//!
//! Host-wide mutual exclusion for dial sessions, stored as `lock.json` in
//! the state directory. A record whose owning process no longer exists is
//! stale and is reclaimed by the next `acquire`.
//!
//! The lock lives on disk so that pppd's ip-down hook, which runs as a
//! separate process, can match a link-down against the locked session and
//! release the lock if the controller is gone.

use crate::state::{self, StateDir, StateError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const LOCK_FILE: &str = "lock.json";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another session is active (pid {}, tag {})", .0.owner_pid, .0.session_tag)]
    Busy(LockRecord),
    #[error("State error: {0}")]
    StateError(#[from] StateError),
    #[error("Failed to release connection lock: {0}")]
    ReleaseFailed(StateError),
}

/// On-disk lock record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: u32,
    pub session_tag: String,
    pub acquired_at: u64,
}

/// Proof of holding the lock; consumed by `release`
#[derive(Debug, PartialEq, Eq)]
pub struct LockToken {
    record: LockRecord,
}

impl LockToken {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn session_tag(&self) -> &str {
        &self.record.session_tag
    }
}

/// Result of a successful `acquire`
#[derive(Debug)]
pub struct Acquired {
    pub token: LockToken,
    /// Stale record of a dead owner that was taken over
    pub reclaimed: Option<LockRecord>,
}

pub use crate::state::process_alive;

pub struct ConnectionLock {
    path: PathBuf,
    liveness: fn(u32) -> bool,
}

impl ConnectionLock {
    pub fn new(state_dir: &StateDir) -> Self {
        Self {
            path: state_dir.path(LOCK_FILE),
            liveness: process_alive,
        }
    }

    /// Lock with a custom liveness check (for testing)
    pub fn with_liveness(state_dir: &StateDir, liveness: fn(u32) -> bool) -> Self {
        Self {
            path: state_dir.path(LOCK_FILE),
            liveness,
        }
    }

    pub fn current(&self) -> Result<Option<LockRecord>, LockError> {
        Ok(state::read_json(&self.path)?)
    }

    /// A record is stale once its owner process is gone
    pub fn is_stale(&self, record: &LockRecord) -> bool {
        !(self.liveness)(record.owner_pid)
    }

    /// Take the lock for `owner_pid`/`session_tag`
    ///
    /// Fails fast with `Busy` when a live record for another session
    /// exists; never waits.
    pub fn acquire(&self, owner_pid: u32, session_tag: &str) -> Result<Acquired, LockError> {
        let record = LockRecord {
            owner_pid,
            session_tag: session_tag.to_string(),
            acquired_at: state::unix_now(),
        };
        let mut reclaimed = None;

        for _ in 0..3 {
            if state::create_json_exclusive(&self.path, &record)? {
                info!("Connection lock acquired by pid {} ({})", owner_pid, session_tag);
                return Ok(Acquired {
                    token: LockToken { record },
                    reclaimed,
                });
            }

            let Some(existing) = self.current()? else {
                continue;
            };

            if existing.session_tag == session_tag && existing.owner_pid == owner_pid {
                debug!("Lock already held by this session");
                return Ok(Acquired {
                    token: LockToken { record: existing },
                    reclaimed,
                });
            }

            if !self.is_stale(&existing) {
                return Err(LockError::Busy(existing));
            }

            warn!(
                "Reclaiming stale lock of dead pid {} ({})",
                existing.owner_pid, existing.session_tag
            );
            if self.take_stale(&existing)? {
                reclaimed = Some(existing);
            }
        }

        match self.current()? {
            Some(existing) => Err(LockError::Busy(existing)),
            None => Err(LockError::StateError(StateError::IoError {
                path: self.path.clone(),
                source: std::io::Error::other("lock contended"),
            })),
        }
    }

    /// Move a stale record out of the way
    ///
    /// If a racing process already replaced it with a live record, that
    /// record is put back and `false` returned.
    fn take_stale(&self, stale: &LockRecord) -> Result<bool, LockError> {
        let aside = StateDir::temp_path(&self.path.with_extension("stale"));
        if !state::claim(&self.path, &aside)? {
            return Ok(false);
        }
        let taken: Option<LockRecord> = state::read_json(&aside)?;
        if taken.as_ref() == Some(stale) {
            state::remove(&aside)?;
            return Ok(true);
        }
        if let Some(live) = taken {
            let _ = state::create_json_exclusive(&self.path, &live)?;
        }
        state::remove(&aside)?;
        Ok(false)
    }

    /// Release the lock held by `token`
    pub fn release(&self, token: LockToken) -> Result<(), LockError> {
        self.remove_if_matches(&token.record)
    }

    /// Release a record on behalf of a dead owner (hook and recovery paths)
    pub fn release_record(&self, record: &LockRecord) -> Result<(), LockError> {
        self.remove_if_matches(record)
    }

    fn remove_if_matches(&self, record: &LockRecord) -> Result<(), LockError> {
        match self.current()? {
            Some(current) if current == *record => {
                state::remove(&self.path).map_err(|e| {
                    error!("Connection lock could not be released: {}", e);
                    LockError::ReleaseFailed(e)
                })?;
                info!("Connection lock released ({})", record.session_tag);
                Ok(())
            }
            Some(current) => {
                warn!(
                    "Lock now held by {} (pid {}), not releasing",
                    current.session_tag, current.owner_pid
                );
                Ok(())
            }
            None => {
                debug!("Lock already released");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn everyone_alive(_: u32) -> bool {
        true
    }

    fn only_even_alive(pid: u32) -> bool {
        pid % 2 == 0
    }

    fn lock(dir: &TempDir, liveness: fn(u32) -> bool) -> ConnectionLock {
        ConnectionLock::with_liveness(&StateDir::new(dir.path()), liveness)
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, everyone_alive);

        let acquired = lock.acquire(100, "vmc-session.100.0").unwrap();
        assert!(acquired.reclaimed.is_none());
        assert_eq!(lock.current().unwrap().unwrap().owner_pid, 100);

        lock.release(acquired.token).unwrap();
        assert!(lock.current().unwrap().is_none());
    }

    #[test]
    fn test_busy_while_owner_alive() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, everyone_alive);

        lock.acquire(100, "vmc-session.100.0").unwrap();
        match lock.acquire(200, "vmc-session.200.0") {
            Err(LockError::Busy(record)) => assert_eq!(record.owner_pid, 100),
            other => panic!("Expected Busy, got {:?}", other),
        }
    }

    #[test]
    fn test_same_process_other_session_is_busy() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, everyone_alive);

        lock.acquire(100, "vmc-session.100.0").unwrap();
        assert!(matches!(
            lock.acquire(100, "vmc-session.100.1"),
            Err(LockError::Busy(_))
        ));
    }

    #[test]
    fn test_stale_record_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, only_even_alive);

        // Owner 101 is "dead"
        lock.acquire(101, "vmc-session.101.0").unwrap();
        let acquired = lock.acquire(200, "vmc-session.200.0").unwrap();

        assert_eq!(acquired.reclaimed.unwrap().owner_pid, 101);
        assert_eq!(lock.current().unwrap().unwrap().owner_pid, 200);
    }

    #[test]
    fn test_busy_then_reclaimable_once_owner_dies() {
        let dir = TempDir::new().unwrap();

        // Spawn a real owner process
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let owner = child.id();

        let real = ConnectionLock::new(&StateDir::new(dir.path()));
        real.acquire(owner, "vmc-session.a").unwrap();
        assert!(matches!(
            real.acquire(std::process::id(), "vmc-session.b"),
            Err(LockError::Busy(_))
        ));

        child.kill().unwrap();
        child.wait().unwrap();

        let acquired = real.acquire(std::process::id(), "vmc-session.b").unwrap();
        assert_eq!(acquired.reclaimed.unwrap().owner_pid, owner);
    }

    #[test]
    fn test_release_leaves_foreign_record() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, only_even_alive);

        let first = lock.acquire(101, "vmc-session.101.0").unwrap();
        lock.acquire(200, "vmc-session.200.0").unwrap();

        // Late release by the reclaimed owner must not drop the new lock
        lock.release(first.token).unwrap();
        assert_eq!(lock.current().unwrap().unwrap().owner_pid, 200);
    }

    #[test]
    fn test_reacquire_by_same_session() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, everyone_alive);

        lock.acquire(100, "vmc-session.100.0").unwrap();
        let again = lock.acquire(100, "vmc-session.100.0").unwrap();
        assert_eq!(again.token.session_tag(), "vmc-session.100.0");
    }

    #[test]
    fn test_process_alive_for_self() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_busy_error_display() {
        let err = LockError::Busy(LockRecord {
            owner_pid: 42,
            session_tag: "vmc-session.42.0".to_string(),
            acquired_at: 0,
        });
        assert_eq!(
            err.to_string(),
            "Another session is active (pid 42, tag vmc-session.42.0)"
        );
    }
}
