//! pppd subprocess handling
//!
//! pppd is started in the foreground (`nodetach`) with the session tag as
//! `ipparam`, which pppd hands to its ip-up/ip-down hooks as `$6` and
//! `PPP_IPPARAM`.

use crate::config::DialConfig;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Why a connect attempt failed, as reported to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    Busy,
    DeviceNotReady,
    AuthRejected,
    NoCarrier,
    Timeout,
    /// Other pppd exit status
    Ppp(i32),
    /// Local setup step failed (privileges, snapshot, overrides)
    Setup(String),
}

impl ConnectFailure {
    /// Stable reason code for scripts and front-ends
    pub fn code(&self) -> &'static str {
        match self {
            ConnectFailure::Busy => "busy",
            ConnectFailure::DeviceNotReady => "device-not-ready",
            ConnectFailure::AuthRejected => "auth-rejected",
            ConnectFailure::NoCarrier => "no-carrier",
            ConnectFailure::Timeout => "timeout",
            ConnectFailure::Ppp(_) => "ppp-error",
            ConnectFailure::Setup(_) => "setup-failed",
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::Ppp(code) => write!(f, "{} (pppd exit {})", self.code(), code),
            ConnectFailure::Setup(msg) => write!(f, "{}: {}", self.code(), msg),
            _ => f.write_str(self.code()),
        }
    }
}

/// pppd exit status 5: terminated by SIGINT/SIGTERM/SIGHUP
pub const EXIT_SIGNALLED: i32 = 5;

/// Map a pppd exit status (see pppd(8) "EXIT STATUS") to a failure reason
///
/// `None` for a clean exit or a signal-driven stop.
pub fn classify_exit(code: Option<i32>) -> Option<ConnectFailure> {
    match code {
        Some(0) | Some(EXIT_SIGNALLED) => None,
        // No kernel PPP support, serial port locked or unopenable
        Some(4) | Some(6) | Some(7) => Some(ConnectFailure::DeviceNotReady),
        // Connect script failed, modem hung up
        Some(8) | Some(16) => Some(ConnectFailure::NoCarrier),
        // Peer failed our auth / we failed to authenticate to the peer
        Some(11) | Some(19) => Some(ConnectFailure::AuthRejected),
        Some(other) => Some(ConnectFailure::Ppp(other)),
        // Killed by a signal we did not send
        None => Some(ConnectFailure::Ppp(-1)),
    }
}

/// Arguments for `pppd`; a given `device` overrides the peer file's tty
pub fn ppp_args(dial: &DialConfig, device: Option<&Path>, session_tag: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(device) = device {
        args.push(device.display().to_string());
    }
    args.extend([
        "call".to_string(),
        dial.peer.clone(),
        "ipparam".to_string(),
        session_tag.to_string(),
        "nodetach".to_string(),
        "usepeerdns".to_string(),
    ]);
    args
}

/// A running pppd
pub struct PppProcess {
    child: Child,
}

impl PppProcess {
    pub fn spawn(dial: &DialConfig, device: Option<&Path>, session_tag: &str) -> io::Result<Self> {
        let args = ppp_args(dial, device, session_tag);
        info!("Starting {} {}", dial.ppp_binary.display(), args.join(" "));
        let child = Command::new(&dial.ppp_binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Stop pppd: SIGTERM first so its ip-down hook runs, SIGKILL after `grace`
    pub async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Some(pid) = self.child.id() {
            debug!("Sending SIGTERM to pppd (pid {})", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to signal pppd: {}", e);
            }
        }

        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        match waited {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!("Waiting for pppd failed: {}", e);
                None
            }
            Err(_) => {
                warn!("pppd ignored SIGTERM for {:?}, killing it", grace);
                let _ = self.child.kill().await;
                None
            }
        }
    }
}
