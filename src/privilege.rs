//! Privilege Boundary Manager
//!
//! Keeps the PPP binary and its credential files locked down while idle.
//! `enable` makes pppd setuid and lets the dial group read the secrets;
//! `disable` puts both back. The controller calls `enable` right before
//! dialing and `disable` after teardown, never leaving them enabled
//! outside a session.

use crate::config::PrivilegeConfig;
use nix::unistd::{chown, Gid, Group};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("Failed to change permissions of {path}: {source}")]
    PermissionError { path: PathBuf, source: io::Error },
    #[error("Failed to change group of {path}: {source}")]
    ChownError { path: PathBuf, source: nix::Error },
    #[error("Unknown group: {0}")]
    UnknownGroup(String),
}

pub struct PrivilegeManager {
    enabled: bool,
    binary: PathBuf,
    credentials: Vec<PathBuf>,
    dial_group: Option<String>,
    binary_idle_mode: u32,
    binary_dial_mode: u32,
    credentials_idle_mode: u32,
    credentials_dial_mode: u32,
}

impl PrivilegeManager {
    pub fn new(config: &PrivilegeConfig) -> Self {
        Self {
            enabled: config.enabled,
            binary: config.ppp_binary.clone(),
            credentials: config.credential_files.clone(),
            dial_group: config.dial_group.clone(),
            binary_idle_mode: config.binary_idle_mode,
            binary_dial_mode: config.binary_dial_mode,
            credentials_idle_mode: config.credentials_idle_mode,
            credentials_dial_mode: config.credentials_dial_mode,
        }
    }

    /// Grant dial-capable permissions
    pub fn enable(&self) -> Result<(), PrivilegeError> {
        if !self.enabled {
            return Ok(());
        }
        let gid = self.dial_gid()?;
        set_mode(&self.binary, self.binary_dial_mode)?;
        for file in self.existing_credentials() {
            if let Some(gid) = gid {
                set_group(file, gid)?;
            }
            set_mode(file, self.credentials_dial_mode)?;
        }
        info!("Dial privileges enabled on {}", self.binary.display());
        Ok(())
    }

    /// Revert to the locked-down baseline
    ///
    /// Every file is attempted even if an earlier one fails; the first
    /// error is returned.
    pub fn disable(&self) -> Result<(), PrivilegeError> {
        if !self.enabled {
            return Ok(());
        }
        let mut first_error = None;

        if let Err(e) = set_mode(&self.binary, self.binary_idle_mode) {
            first_error.get_or_insert(e);
        }
        for file in self.existing_credentials() {
            if let Err(e) = set_mode(file, self.credentials_idle_mode) {
                first_error.get_or_insert(e);
            }
            if self.dial_group.is_some() {
                if let Err(e) = set_group(file, Gid::from_raw(0)) {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Dial privileges revoked");
                Ok(())
            }
        }
    }

    /// Whether the PPP binary currently carries its dial mode
    pub fn is_dial_capable(&self) -> bool {
        fs::metadata(&self.binary)
            .map(|m| m.permissions().mode() & 0o7777 == self.binary_dial_mode & 0o7777)
            .unwrap_or(false)
    }

    fn dial_gid(&self) -> Result<Option<Gid>, PrivilegeError> {
        let Some(ref name) = self.dial_group else {
            return Ok(None);
        };
        match Group::from_name(name) {
            Ok(Some(group)) => Ok(Some(group.gid)),
            _ => Err(PrivilegeError::UnknownGroup(name.clone())),
        }
    }

    fn existing_credentials(&self) -> impl Iterator<Item = &PathBuf> {
        self.credentials.iter().filter(|p| {
            let exists = p.exists();
            if !exists {
                debug!("Credential file {} not present, skipping", p.display());
            }
            exists
        })
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), PrivilegeError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        warn!("chmod {:o} {} failed: {}", mode, path.display(), source);
        PrivilegeError::PermissionError {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn set_group(path: &Path, gid: Gid) -> Result<(), PrivilegeError> {
    chown(path, None, Some(gid)).map_err(|source| PrivilegeError::ChownError {
        path: path.to_path_buf(),
        source,
    })
}
