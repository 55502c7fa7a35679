//! Foreground controller for `vmc-connect connect`
//!
//! Runs pppd and turns everything that can happen to it into
//! [`SessionEvent`]s: pppd exiting, SIGINT/SIGTERM (via `ctrlc`), the ip-up
//! hook's link notice, a `disconnect` request, and the dial deadline.

use super::machine::{Directive, SessionEvent, SessionMachine, SessionOutcome, SessionState};
use super::notice::{DisconnectRequest, LinkNotice};
use super::ppp::{ConnectFailure, PppProcess};
use super::{SessionContext, SessionError};
use crate::config::{Config, DialConfig};
use crate::device::resolve_dial_device;
use crate::state::StateDir;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

/// How often the state directory is checked for notices
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Dial and hold a session until it ends
///
/// A connect refused before pppd starts comes back as
/// `SessionOutcome::Failed`; `Err` is reserved for teardown that could not
/// release the lock.
pub async fn run_session(
    config: &Config,
    timeout_secs: Option<u64>,
) -> Result<SessionOutcome, SessionError> {
    let context = SessionContext::from_config(config)?;
    let device = resolve_dial_device(config);
    info!("Dialing on {}", device.display());
    let mut machine = context
        .into_machine(&config.dial.tag_prefix)
        .with_device(device);

    if let Err(failure) = machine.connect() {
        return Ok(SessionOutcome::Failed(failure));
    }

    let (signal_tx, signals) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    }) {
        warn!("Could not install signal handler: {}", e);
    }

    let dial_timeout = Duration::from_secs(timeout_secs.unwrap_or(config.dial.timeout_secs));
    drive_session(&mut machine, &config.dial, dial_timeout, signals).await
}

/// Event loop for a machine that has just entered `DialInProgress`
pub(crate) async fn drive_session(
    machine: &mut SessionMachine,
    dial: &DialConfig,
    dial_timeout: Duration,
    mut signals: UnboundedReceiver<()>,
) -> Result<SessionOutcome, SessionError> {
    let Some(tag) = machine.session_tag().map(str::to_string) else {
        return Ok(SessionOutcome::Failed(ConnectFailure::Setup(
            "no session to drive".to_string(),
        )));
    };
    let state_dir = machine.guard().state_dir().clone();
    let grace = Duration::from_secs(dial.terminate_grace_secs);

    let device = machine.device().map(Path::to_path_buf);
    let mut ppp = match PppProcess::spawn(dial, device.as_deref(), &tag) {
        Ok(ppp) => ppp,
        Err(e) => {
            let message = format!("starting {}: {}", dial.ppp_binary.display(), e);
            machine.on_event(SessionEvent::LaunchFailed(message));
            return finish(machine);
        }
    };
    debug!("pppd running as pid {:?}", ppp.id());

    let deadline = tokio::time::sleep(dial_timeout);
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        let event = tokio::select! {
            status = ppp.wait() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!("Lost track of pppd: {}", e);
                        None
                    }
                };
                info!("pppd exited with {:?}", code);
                SessionEvent::PppExited(code)
            }
            Some(()) = signals.recv() => {
                // `vmc-connect disconnect` leaves a request before signalling
                if take_disconnect(&state_dir, &tag) {
                    SessionEvent::DisconnectRequested
                } else {
                    SessionEvent::Signal
                }
            }
            _ = &mut deadline, if machine.state() == SessionState::DialInProgress => {
                warn!("No link after {:?}", dial_timeout);
                SessionEvent::DialTimeout
            }
            _ = poll.tick() => match poll_notices(&state_dir, &tag, machine.state()) {
                Some(event) => event,
                None => continue,
            },
        };

        match machine.on_event(event) {
            Directive::Continue => {}
            Directive::StopPpp => {
                let code = ppp.terminate(grace).await;
                debug!("pppd stopped with {:?}", code);
                break;
            }
            Directive::Finish => break,
        }
    }

    finish(machine)
}

fn finish(machine: &mut SessionMachine) -> Result<SessionOutcome, SessionError> {
    Ok(machine
        .finish_teardown()?
        .unwrap_or(SessionOutcome::Disconnected))
}

fn take_disconnect(state_dir: &StateDir, tag: &str) -> bool {
    DisconnectRequest::take_for(state_dir, tag).unwrap_or_else(|e| {
        warn!("Could not read disconnect request: {}", e);
        false
    })
}

fn poll_notices(state_dir: &StateDir, tag: &str, state: SessionState) -> Option<SessionEvent> {
    if take_disconnect(state_dir, tag) {
        return Some(SessionEvent::DisconnectRequested);
    }
    if state != SessionState::DialInProgress {
        return None;
    }
    match LinkNotice::for_session(state_dir, tag) {
        Ok(Some(settings)) => Some(SessionEvent::LinkUp(settings)),
        Ok(None) => None,
        Err(e) => {
            warn!("Could not read link notice: {}", e);
            None
        }
    }
}
