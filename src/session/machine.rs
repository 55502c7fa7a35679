//! Session state machine
//!
//! ```text
//! Idle -> Acquiring -> DialInProgress -> Connected -> TearingDown -> Idle
//!            |               |                          ^   |
//!            |               +--------------------------+   | dial never completed
//!            |                                              v
//!            +------------------------------------------> Failed -> Idle
//! ```
//!
//! The machine is synchronous. External triggers (link-up notices, pppd
//! exit, disconnect requests, signals, the dial timer) arrive as discrete
//! [`SessionEvent`]s; the async runtime owns the pppd process and acts on
//! the returned [`Directive`].
//!
//! Ordering: lock, privileges, snapshot before pppd starts; overrides only
//! once connected; restore, then privileges, then lock release on teardown.

use super::lock::{ConnectionLock, LockError, LockToken};
use super::notice::LinkNotice;
use super::ppp::{classify_exit, ConnectFailure};
use super::SessionError;
use crate::network::{GuardError, NegotiatedSettings, NetworkGuard, RestoreReport, SnapshotHandle};
use crate::privilege::PrivilegeManager;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    DialInProgress,
    Connected,
    TearingDown,
    Failed,
}

impl SessionState {
    /// A session owns the host network while in these states
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::DialInProgress | SessionState::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LinkUp(NegotiatedSettings),
    PppExited(Option<i32>),
    LaunchFailed(String),
    DisconnectRequested,
    Signal,
    DialTimeout,
}

/// What the runtime must do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Stop pppd gracefully, then call `finish_teardown`
    StopPpp,
    /// pppd is already gone; call `finish_teardown`
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TeardownCause {
    Requested,
    Signal,
    PppExited(Option<i32>),
    DialTimeout,
    SetupFailed(String),
}

/// Terminal status of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Stopped on request or by signal
    Disconnected,
    /// Never reached Connected
    Failed(ConnectFailure),
    /// pppd exited on its own after the link was up
    Dropped(Option<i32>),
}

struct ActiveSession {
    token: LockToken,
    snapshot: Option<SnapshotHandle>,
    connected: bool,
}

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Tag unique to one session of one process
pub fn new_session_tag(prefix: &str, pid: u32) -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}.{}.{}", prefix, pid, n)
}

pub struct SessionMachine {
    state: SessionState,
    lock: ConnectionLock,
    guard: NetworkGuard,
    privileges: PrivilegeManager,
    owner_pid: u32,
    tag_prefix: String,
    device: Option<PathBuf>,
    active: Option<ActiveSession>,
    cause: Option<TeardownCause>,
    #[cfg(test)]
    trail: Vec<SessionState>,
}

impl SessionMachine {
    pub fn new(
        lock: ConnectionLock,
        guard: NetworkGuard,
        privileges: PrivilegeManager,
        tag_prefix: &str,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            lock,
            guard,
            privileges,
            owner_pid: std::process::id(),
            tag_prefix: tag_prefix.to_string(),
            device: None,
            active: None,
            cause: None,
            #[cfg(test)]
            trail: Vec::new(),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        debug!("Session state {:?} -> {:?}", self.state, next);
        #[cfg(test)]
        self.trail.push(next);
        self.state = next;
    }

    /// Dial on this modem data port, refusing while it is missing
    pub fn with_device(mut self, device: PathBuf) -> Self {
        self.device = Some(device);
        self
    }

    pub fn device(&self) -> Option<&Path> {
        self.device.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_tag(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.token.session_tag())
    }

    pub fn guard(&self) -> &NetworkGuard {
        &self.guard
    }

    /// Idle -> Acquiring -> DialInProgress
    ///
    /// On success returns the session tag to pass to pppd. On failure the
    /// machine is back in `Idle` with nothing left held.
    pub fn connect(&mut self) -> Result<String, ConnectFailure> {
        if self.state != SessionState::Idle {
            return Err(ConnectFailure::Busy);
        }

        if let Some(ref device) = self.device {
            if !device.exists() {
                warn!("Modem data port {} not present", device.display());
                return Err(ConnectFailure::DeviceNotReady);
            }
        }

        self.set_state(SessionState::Acquiring);
        let tag = new_session_tag(&self.tag_prefix, self.owner_pid);

        let acquired = match self.lock.acquire(self.owner_pid, &tag) {
            Ok(acquired) => acquired,
            Err(LockError::Busy(record)) => {
                info!(
                    "Connect refused: session {} (pid {}) is active",
                    record.session_tag, record.owner_pid
                );
                self.set_state(SessionState::Idle);
                return Err(ConnectFailure::Busy);
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                return Err(ConnectFailure::Setup(e.to_string()));
            }
        };

        if let Some(stale) = acquired.reclaimed {
            info!("Recovering network state left by {}", stale.session_tag);
            if let Err(e) = self.guard.restore_pending() {
                warn!("Recovery restore failed: {}", e);
            }
        }

        self.active = Some(ActiveSession {
            token: acquired.token,
            snapshot: None,
            connected: false,
        });

        if let Err(e) = self.privileges.enable() {
            return Err(self.abort_setup(format!("enabling privileges: {}", e)));
        }

        let snapshot = match self.guard.snapshot(&tag) {
            Err(GuardError::SnapshotPending(previous)) => {
                warn!("Orphaned snapshot of {} found, restoring it first", previous);
                self.guard
                    .restore_pending()
                    .and_then(|_| self.guard.snapshot(&tag))
            }
            other => other,
        };
        match snapshot {
            Ok(handle) => {
                if let Some(active) = self.active.as_mut() {
                    active.snapshot = Some(handle);
                }
            }
            Err(e) => return Err(self.abort_setup(format!("taking snapshot: {}", e))),
        }

        self.set_state(SessionState::DialInProgress);
        info!("Session {} dialing", tag);
        Ok(tag)
    }

    /// Acquiring -> Failed -> Idle, undoing what was set up so far
    fn abort_setup(&mut self, message: String) -> ConnectFailure {
        error!("Session setup failed: {}", message);
        self.set_state(SessionState::Failed);
        if let Some(active) = self.active.take() {
            if let Some(ref handle) = active.snapshot {
                if let Err(e) = self.guard.restore(handle) {
                    warn!("Restore after failed setup: {}", e);
                }
            }
            if let Err(e) = self.privileges.disable() {
                warn!("Revoking privileges after failed setup: {}", e);
            }
            if let Err(e) = self.lock.release(active.token) {
                error!("{}", e);
            }
        }
        self.set_state(SessionState::Idle);
        ConnectFailure::Setup(message)
    }

    /// Feed one external event into the machine
    pub fn on_event(&mut self, event: SessionEvent) -> Directive {
        debug!("Event {:?} in state {:?}", event, self.state);
        match event {
            SessionEvent::LinkUp(settings) => self.link_up(&settings),
            SessionEvent::PppExited(code) => {
                if self.begin_teardown(TeardownCause::PppExited(code)) {
                    Directive::Finish
                } else {
                    Directive::Continue
                }
            }
            SessionEvent::LaunchFailed(message) => {
                if self.begin_teardown(TeardownCause::SetupFailed(message)) {
                    Directive::Finish
                } else {
                    Directive::Continue
                }
            }
            SessionEvent::DisconnectRequested => self.stop(TeardownCause::Requested),
            SessionEvent::Signal => self.stop(TeardownCause::Signal),
            SessionEvent::DialTimeout => {
                if self.state == SessionState::DialInProgress {
                    self.stop(TeardownCause::DialTimeout)
                } else {
                    Directive::Continue
                }
            }
        }
    }

    fn stop(&mut self, cause: TeardownCause) -> Directive {
        if self.begin_teardown(cause) {
            Directive::StopPpp
        } else {
            Directive::Continue
        }
    }

    /// DialInProgress -> Connected
    fn link_up(&mut self, settings: &NegotiatedSettings) -> Directive {
        if self.state != SessionState::DialInProgress {
            debug!("Ignoring link-up in state {:?}", self.state);
            return Directive::Continue;
        }
        let Some(handle) = self.active.as_ref().and_then(|a| a.snapshot.clone()) else {
            return self.stop(TeardownCause::SetupFailed("no snapshot".to_string()));
        };

        match self.guard.apply_overrides(&handle, settings) {
            Ok(()) => {
                if let Some(active) = self.active.as_mut() {
                    active.connected = true;
                }
                self.set_state(SessionState::Connected);
                info!(
                    "Connected on {} (local {}, remote {})",
                    settings.interface, settings.local, settings.remote
                );
                Directive::Continue
            }
            Err(e) => self.stop(TeardownCause::SetupFailed(format!(
                "applying overrides: {}",
                e
            ))),
        }
    }

    /// Enter TearingDown; `false` if another trigger got there first
    fn begin_teardown(&mut self, cause: TeardownCause) -> bool {
        if !self.state.is_active() {
            debug!("Teardown ({:?}) ignored in state {:?}", cause, self.state);
            return false;
        }
        info!("Tearing down session: {:?}", cause);
        self.set_state(SessionState::TearingDown);
        self.cause = Some(cause);
        true
    }

    /// TearingDown -> Idle, via Failed for a dial that never completed:
    /// restore, revoke privileges, release the lock
    ///
    /// Returns `Ok(None)` when there is nothing to tear down. The only error
    /// is a failed lock release.
    pub fn finish_teardown(&mut self) -> Result<Option<SessionOutcome>, SessionError> {
        if self.state != SessionState::TearingDown {
            return Ok(None);
        }
        let Some(active) = self.active.take() else {
            self.set_state(SessionState::Idle);
            return Ok(None);
        };
        let cause = self.cause.take();

        if let Some(ref handle) = active.snapshot {
            match self.guard.restore(handle) {
                Ok(RestoreReport::NothingPending) => {
                    debug!("Snapshot already restored by the ip-down hook")
                }
                Ok(RestoreReport::Restored { .. }) => {}
                Err(e) => warn!("Restore failed: {}", e),
            }
        }
        if let Err(e) = LinkNotice::clear(self.guard.state_dir()) {
            debug!("Could not clear link notice: {}", e);
        }

        if let Err(e) = self.privileges.disable() {
            error!("Failed to revoke dial privileges: {}", e);
        }

        let outcome = outcome_for(cause, active.connected);
        if matches!(outcome, SessionOutcome::Failed(_)) {
            self.set_state(SessionState::Failed);
        }
        self.set_state(SessionState::Idle);

        self.lock
            .release(active.token)
            .map_err(SessionError::LockReleaseFailed)?;

        info!("Session ended: {:?}", outcome);
        Ok(Some(outcome))
    }
}

fn outcome_for(cause: Option<TeardownCause>, connected: bool) -> SessionOutcome {
    match cause {
        None | Some(TeardownCause::Requested) | Some(TeardownCause::Signal) => {
            SessionOutcome::Disconnected
        }
        Some(TeardownCause::DialTimeout) => SessionOutcome::Failed(ConnectFailure::Timeout),
        Some(TeardownCause::SetupFailed(msg)) => SessionOutcome::Failed(ConnectFailure::Setup(msg)),
        Some(TeardownCause::PppExited(code)) if connected => SessionOutcome::Dropped(code),
        Some(TeardownCause::PppExited(code)) => match classify_exit(code) {
            Some(failure) => SessionOutcome::Failed(failure),
            // Clean exit before link-up still means the dial did not complete
            None => SessionOutcome::Failed(ConnectFailure::Ppp(code.unwrap_or(0))),
        },
    }
}
