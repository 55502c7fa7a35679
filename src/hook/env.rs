//! pppd hook environment parsing
//!
//! pppd runs `/etc/ppp/ip-up` and `/etc/ppp/ip-down` with positional
//! arguments and an environment describing the link. Both carry the same
//! values; the environment wins when present.
//!
//! # Key Variables
//!
//! | Variable | Arg | Example | Description |
//! |----------|-----|---------|-------------|
//! | `PPP_IFACE` | `$1` | `ppp0` | PPP interface |
//! | `PPP_TTY` | `$2` | `/dev/ttyUSB0` | Modem data port |
//! | `PPP_LOCAL` | `$4` | `10.64.1.5` | Our address |
//! | `PPP_REMOTE` | `$5` | `10.64.64.64` | Peer address |
//! | `PPP_IPPARAM` | `$6` | `vmc-session.4242.0` | Session tag |
//! | `DNS1`, `DNS2` | | `10.11.12.13` | Peer DNS (`usepeerdns`) |

use crate::network::NegotiatedSettings;
use std::env;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookEnvError {
    #[error("Missing required hook value: {0}")]
    MissingVar(String),
    #[error("Invalid IP address in {var}: {value}")]
    InvalidIp { var: String, value: String },
    #[error("Unknown hook: {0}")]
    UnknownHook(String),
}

/// Which pppd hook invoked us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Link is up and addresses are assigned
    IpUp,
    /// Link went down
    IpDown,
}

impl std::str::FromStr for HookKind {
    type Err = HookEnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip-up" => Ok(HookKind::IpUp),
            "ip-down" => Ok(HookKind::IpDown),
            _ => Err(HookEnvError::UnknownHook(s.to_string())),
        }
    }
}

/// Parsed hook invocation
#[derive(Debug, Clone)]
pub struct PppHookEnv {
    pub kind: HookKind,
    pub interface: String,
    pub tty: Option<String>,
    pub local: Option<IpAddr>,
    pub remote: Option<IpAddr>,
    /// `ipparam`, absent for sessions we did not start
    pub session_tag: Option<String>,
    pub dns_servers: Vec<IpAddr>,
}

impl PppHookEnv {
    /// Parse the hook invocation of the current process
    pub fn from_env(kind: HookKind, args: &[String]) -> Result<Self, HookEnvError> {
        Self::from_env_fn(kind, args, |key| env::var(key))
    }

    /// Parse using a custom environment getter (for testing)
    pub fn from_env_fn<F>(kind: HookKind, args: &[String], get_var: F) -> Result<Self, HookEnvError>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let value = |var: &str, position: usize| -> Option<String> {
            get_var(var)
                .ok()
                .or_else(|| args.get(position).cloned())
                .filter(|v| !v.is_empty())
        };

        let interface =
            value("PPP_IFACE", 0).ok_or_else(|| HookEnvError::MissingVar("PPP_IFACE".into()))?;
        let tty = value("PPP_TTY", 1);
        let local = value("PPP_LOCAL", 3)
            .map(|v| parse_ip("PPP_LOCAL", v))
            .transpose()?;
        let remote = value("PPP_REMOTE", 4)
            .map(|v| parse_ip("PPP_REMOTE", v))
            .transpose()?;
        let session_tag = value("PPP_IPPARAM", 5);

        let dns_servers = ["DNS1", "DNS2"]
            .iter()
            .filter_map(|var| get_var(var).ok())
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        Ok(Self {
            kind,
            interface,
            tty,
            local,
            remote,
            session_tag,
            dns_servers,
        })
    }

    /// Link settings to hand to the controller
    pub fn settings(&self) -> Result<NegotiatedSettings, HookEnvError> {
        Ok(NegotiatedSettings {
            interface: self.interface.clone(),
            local: self
                .local
                .ok_or_else(|| HookEnvError::MissingVar("PPP_LOCAL".into()))?,
            remote: self
                .remote
                .ok_or_else(|| HookEnvError::MissingVar("PPP_REMOTE".into()))?,
            dns_servers: self.dns_servers.clone(),
        })
    }
}

fn parse_ip(var: &str, value: String) -> Result<IpAddr, HookEnvError> {
    value.parse().map_err(|_| HookEnvError::InvalidIp {
        var: var.to_string(),
        value,
    })
}
