//! Persistent state files shared between the controller and hook processes
//!
//! Everything the session needs to survive a crash of the controlling
//! process lives in small JSON records under a transient state directory
//! (`/run/vmc-connect` by default):
//!
//! | File | Owner | Contents |
//! |------|-------|----------|
//! | `lock.json` | [`crate::session::lock`] | Connection lock record |
//! | `snapshot.json` | [`crate::network::snapshot`] | Pre-session network state |
//! | `snapshot.restoring-<pid>` | [`crate::network::guard`] | Snapshot claimed by a restorer |
//! | `link.json` | [`crate::hook`] | Settings negotiated by pppd |
//! | `devices/*.json` | [`crate::device::registry`] | Handled USB devices |
//!
//! All writes go through a temp file followed by `rename`, so readers never
//! observe a half-written record.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("State file I/O failed for {path}: {source}")]
    IoError { path: PathBuf, source: io::Error },
    #[error("Failed to parse state file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize state: {0}")]
    SerializeError(#[from] serde_json::Error),
}

impl StateError {
    fn io(path: &Path, source: io::Error) -> Self {
        StateError::IoError {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Default location for transient session state
pub const DEFAULT_STATE_DIR: &str = "/run/vmc-connect";

/// Handle to the transient state directory
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create the directory (and parents) if missing
    pub fn ensure(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.root).map_err(|e| StateError::io(&self.root, e))
    }

    /// Temp file name unique to this process, next to `target`
    pub fn temp_path(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp-{}", std::process::id()));
        target.with_file_name(name)
    }
}

/// Serialize `value` as pretty JSON
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StateError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Atomically replace `path` with the JSON encoding of `value`
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }
    let tmp = StateDir::temp_path(path);
    fs::write(&tmp, encode(value)?).map_err(|e| StateError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StateError::io(path, e)
    })?;
    debug!("Wrote state file {}", path.display());
    Ok(())
}

/// Create `path` holding `value`, failing with `Ok(false)` if it already exists
///
/// The record is fully written to a temp file first and then hard-linked
/// into place, so the creation is exclusive and never exposes partial data.
pub fn create_json_exclusive<T: Serialize>(path: &Path, value: &T) -> Result<bool, StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }
    let tmp = StateDir::temp_path(path);
    fs::write(&tmp, encode(value)?).map_err(|e| StateError::io(&tmp, e))?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StateError::io(path, e)),
    }
}

/// Read a JSON record, `None` if the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StateError::ParseError {
            path: path.to_path_buf(),
            source,
        })
}

/// Delete a record, returning whether it existed
pub fn remove(path: &Path) -> Result<bool, StateError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StateError::io(path, e)),
    }
}

/// Atomically move `from` to `to`, `Ok(false)` if `from` is already gone
///
/// Used to claim a record so that only one of several racing processes
/// acts on it.
pub fn claim(from: &Path, to: &Path) -> Result<bool, StateError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StateError::io(from, e)),
    }
}

/// Whether a process with `pid` exists
pub fn process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        pid: u32,
        name: String,
    }

    fn record() -> Record {
        Record {
            pid: 42,
            name: "vmc".to_string(),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("record.json");

        write_json(&path, &record()).unwrap();

        let loaded: Option<Record> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(record()));
        assert!(!StateDir::temp_path(&path).exists());
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Record> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_read_corrupt_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();

        let result: Result<Option<Record>, _> = read_json(&path);
        assert!(matches!(result, Err(StateError::ParseError { .. })));
    }

    #[test]
    fn test_create_exclusive_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.json");

        assert!(create_json_exclusive(&path, &record()).unwrap());
        let other = Record {
            pid: 7,
            name: "other".to_string(),
        };
        assert!(!create_json_exclusive(&path, &other).unwrap());

        let loaded: Option<Record> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(record()));
    }

    #[test]
    fn test_claim_only_once() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("snapshot.json");
        let to = dir.path().join("snapshot.json.claimed");
        write_json(&from, &record()).unwrap();

        assert!(claim(&from, &to).unwrap());
        assert!(!claim(&from, &to).unwrap());
        assert!(to.exists());
    }

    #[test]
    fn test_remove_reports_existence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");
        write_json(&path, &record()).unwrap();

        assert!(remove(&path).unwrap());
        assert!(!remove(&path).unwrap());
    }
}
