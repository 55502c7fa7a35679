//! Dial session control
//!
//! - `lock`: host-wide connection lock
//! - `machine`: the session state machine
//! - `notice`: link-up and disconnect notices from other processes
//! - `ppp`: pppd subprocess and exit status mapping
//! - `runtime`: async driver tying pppd, signals and notices to the machine

pub mod lock;
pub mod machine;
pub mod notice;
pub mod ppp;
pub mod runtime;

pub use lock::{ConnectionLock, LockError, LockRecord, LockToken};
pub use machine::{Directive, SessionEvent, SessionMachine, SessionOutcome, SessionState};
pub use notice::{DisconnectRequest, LinkNotice};
pub use ppp::ConnectFailure;
pub use runtime::run_session;

use crate::config::Config;
use crate::network::{GuardError, NetworkGuard, NetworkSnapshot, RestoreReport};
use crate::privilege::{PrivilegeError, PrivilegeManager};
use crate::state::{StateDir, StateError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Lock error: {0}")]
    LockError(#[from] LockError),
    #[error("Connection lock left held: {0}")]
    LockReleaseFailed(LockError),
    #[error("Network guard error: {0}")]
    GuardError(#[from] GuardError),
    #[error("Privilege error: {0}")]
    PrivilegeError(#[from] PrivilegeError),
    #[error("State error: {0}")]
    StateError(#[from] StateError),
    #[error("Session {} is still running (pid {})", .0.session_tag, .0.owner_pid)]
    OwnerAlive(LockRecord),
    #[error("Failed to signal pid {pid}: {source}")]
    SignalFailed { pid: u32, source: nix::Error },
}

/// What `recover` cleaned up
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Stale lock record that was released
    pub released: Option<LockRecord>,
    pub restored: bool,
    pub privileges_revoked: bool,
}

/// Result of `request_disconnect`
#[derive(Debug)]
pub enum DisconnectOutcome {
    NotConnected,
    /// The live controller was asked to stop
    Requested(LockRecord),
    /// The owner was already dead; state was recovered directly
    Recovered(RecoveryReport),
}

/// Snapshot of the on-disk session state
#[derive(Debug)]
pub struct StatusReport {
    pub lock: Option<LockRecord>,
    pub owner_alive: bool,
    pub snapshot: Option<NetworkSnapshot>,
    pub link: Option<LinkNotice>,
    pub dial_capable: bool,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.lock, &self.link) {
            (None, _) => writeln!(f, "Session: none")?,
            (Some(record), _) if !self.owner_alive => writeln!(
                f,
                "Session: stale ({}, pid {} is gone; run `vmc-connect recover`)",
                record.session_tag, record.owner_pid
            )?,
            (Some(record), Some(link)) if link.session_tag == record.session_tag => {
                writeln!(f, "Session: connected ({})", record.session_tag)?;
                writeln!(f, "  Owner pid: {}", record.owner_pid)?;
                writeln!(f, "  Interface: {}", link.settings.interface)?;
                writeln!(f, "  Local: {}", link.settings.local)?;
                writeln!(f, "  Remote: {}", link.settings.remote)?;
                for dns in &link.settings.dns_servers {
                    writeln!(f, "  DNS: {}", dns)?;
                }
            }
            (Some(record), _) => {
                writeln!(f, "Session: dialing ({})", record.session_tag)?;
                writeln!(f, "  Owner pid: {}", record.owner_pid)?;
            }
        }
        if let Some(ref snapshot) = self.snapshot {
            let route = snapshot
                .default_route
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "(none)".to_string());
            writeln!(f, "Pending restore: {} (route {})", snapshot.session_tag, route)?;
        }
        write!(
            f,
            "Dial privileges: {}",
            if self.dial_capable { "enabled" } else { "revoked" }
        )
    }
}

/// The host state a controller or hook works on
pub struct SessionContext {
    pub lock: ConnectionLock,
    pub guard: NetworkGuard,
    pub privileges: PrivilegeManager,
}

impl SessionContext {
    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        let state_dir = StateDir::new(&config.network.state_dir);
        Ok(Self {
            lock: ConnectionLock::new(&state_dir),
            guard: NetworkGuard::from_config(&config.network)?,
            privileges: PrivilegeManager::new(&config.privileges),
        })
    }

    pub fn state_dir(&self) -> &StateDir {
        self.guard.state_dir()
    }

    pub fn into_machine(self, tag_prefix: &str) -> SessionMachine {
        SessionMachine::new(self.lock, self.guard, self.privileges, tag_prefix)
    }

    /// Clean up after a controller that died
    ///
    /// Refuses while the lock owner is alive. Without any lock, still
    /// restores an orphaned snapshot and revokes leftover privileges.
    pub fn recover(&self) -> Result<RecoveryReport, SessionError> {
        let current = self.lock.current()?;
        if let Some(ref record) = current {
            if !self.lock.is_stale(record) {
                return Err(SessionError::OwnerAlive(record.clone()));
            }
            warn!(
                "Recovering stale session {} (pid {})",
                record.session_tag, record.owner_pid
            );
        }

        let mut report = RecoveryReport::default();

        // Restore before the lock goes away
        report.restored = matches!(self.guard.restore_pending()?, RestoreReport::Restored { .. });
        if let Err(e) = LinkNotice::clear(self.state_dir()) {
            warn!("Could not clear link notice: {}", e);
        }

        if current.is_some() || self.privileges.is_dial_capable() {
            self.privileges.disable()?;
            report.privileges_revoked = true;
        }

        if let Some(record) = current {
            self.lock
                .release_record(&record)
                .map_err(SessionError::LockReleaseFailed)?;
            report.released = Some(record);
        }

        info!("Recovery complete: {:?}", report);
        Ok(report)
    }

    /// Ask the running controller to disconnect
    pub fn request_disconnect(&self) -> Result<DisconnectOutcome, SessionError> {
        let Some(record) = self.lock.current()? else {
            return Ok(DisconnectOutcome::NotConnected);
        };
        if self.lock.is_stale(&record) {
            return Ok(DisconnectOutcome::Recovered(self.recover()?));
        }

        DisconnectRequest::new(&record.session_tag).store(self.state_dir())?;
        match kill(Pid::from_raw(record.owner_pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                info!(
                    "Disconnect requested from {} (pid {})",
                    record.session_tag, record.owner_pid
                );
                Ok(DisconnectOutcome::Requested(record))
            }
            // Died between the liveness check and the signal
            Err(Errno::ESRCH) => Ok(DisconnectOutcome::Recovered(self.recover()?)),
            Err(source) => Err(SessionError::SignalFailed {
                pid: record.owner_pid,
                source,
            }),
        }
    }

    pub fn status(&self) -> Result<StatusReport, SessionError> {
        let lock = self.lock.current()?;
        let owner_alive = lock.as_ref().is_some_and(|r| !self.lock.is_stale(r));
        Ok(StatusReport {
            lock,
            owner_alive,
            snapshot: crate::network::snapshot::load_pending(self.state_dir())?,
            link: LinkNotice::load(self.state_dir())?,
            dial_capable: self.privileges.is_dial_capable(),
        })
    }
}
