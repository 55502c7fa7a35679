//! Host network state around a session
//!
//! - `guard`: snapshot, override and restore of route/DNS state
//! - `resolver`: resolver configuration file handling
//! - `snapshot`: persisted pre-session state

pub mod guard;
pub mod resolver;
pub mod snapshot;

pub use guard::{GuardError, NetworkGuard, RestoreReport};
pub use snapshot::{NetworkSnapshot, ResolverBackup, SnapshotHandle};

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Link parameters reported by pppd once the interface is up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedSettings {
    /// PPP interface, e.g. `ppp0`
    pub interface: String,
    pub local: IpAddr,
    pub remote: IpAddr,
    /// Servers from `usepeerdns`, empty if the peer sent none
    pub dns_servers: Vec<IpAddr>,
}
