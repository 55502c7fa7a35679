//! Persisted pre-session network state
//!
//! The snapshot is written before any network change and updated *before*
//! each override is applied, so a restore driven by another process after a
//! crash knows exactly what the session may have changed.

use crate::platform::DefaultRoute;
use crate::state::{self, StateDir, StateError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;

pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Prefix of a snapshot claimed for restore, followed by the restorer's pid
pub const CLAIM_PREFIX: &str = "snapshot.restoring-";

/// What the resolver file looked like before the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverBackup {
    /// Left to the platform's resolver management; never touched
    Unmanaged,
    /// No file existed; restore deletes the session's file
    Absent,
    /// Original contents, written back on restore
    Saved { contents: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub session_tag: String,
    pub taken_at: u64,
    pub default_route: Option<DefaultRoute>,
    pub resolver: ResolverBackup,
    /// Default route the session installed (recorded before installing it)
    #[serde(default)]
    pub session_route: Option<DefaultRoute>,
    /// Whether the session wrote the resolver file
    #[serde(default)]
    pub dns_overridden: bool,
}

/// Reference to the snapshot of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub session_tag: String,
    path: PathBuf,
}

impl SnapshotHandle {
    pub fn new(state_dir: &StateDir, session_tag: &str) -> Self {
        Self {
            session_tag: session_tag.to_string(),
            path: snapshot_path(state_dir),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<NetworkSnapshot>, StateError> {
        let snapshot: Option<NetworkSnapshot> = state::read_json(&self.path)?;
        Ok(snapshot.filter(|s| s.session_tag == self.session_tag))
    }

    pub fn store(&self, snapshot: &NetworkSnapshot) -> Result<(), StateError> {
        state::write_json(&self.path, snapshot)
    }
}

pub fn snapshot_path(state_dir: &StateDir) -> PathBuf {
    state_dir.path(SNAPSHOT_FILE)
}

/// Where process `pid` keeps a snapshot it has claimed for restore
pub fn claim_path(state_dir: &StateDir, pid: u32) -> PathBuf {
    state_dir.path(&format!("{}{}", CLAIM_PREFIX, pid))
}

/// Claimed snapshots whose restorer died before finishing
///
/// A restorer that crashes between claiming and removing the snapshot
/// leaves `snapshot.restoring-<pid>` behind. Claims of the current process
/// and of live processes are skipped.
pub fn abandoned_claims(
    state_dir: &StateDir,
    liveness: fn(u32) -> bool,
) -> Result<Vec<PathBuf>, StateError> {
    let root = state_dir.root();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StateError::IoError {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    let own = std::process::id();
    let mut claims = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name
            .to_str()
            .and_then(|n| n.strip_prefix(CLAIM_PREFIX))
            .and_then(|p| p.parse::<u32>().ok())
        else {
            continue;
        };
        if pid != own && !liveness(pid) {
            claims.push(entry.path());
        }
    }
    claims.sort();
    Ok(claims)
}

/// The pending snapshot, whichever session it belongs to
pub fn load_pending(state_dir: &StateDir) -> Result<Option<NetworkSnapshot>, StateError> {
    state::read_json(&snapshot_path(state_dir))
}
