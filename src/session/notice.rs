//! Notices passed from other processes to the running controller
//!
//! - `link.json`: written by the ip-up hook once pppd has an address
//! - `disconnect.json`: written by `vmc-connect disconnect`
//!
//! Both carry the session tag so a leftover notice from an earlier session
//! is never mistaken for one addressed to the current session.

use crate::network::NegotiatedSettings;
use crate::state::{self, StateDir, StateError};
use serde::{Deserialize, Serialize};

pub const LINK_FILE: &str = "link.json";
pub const DISCONNECT_FILE: &str = "disconnect.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkNotice {
    pub session_tag: String,
    pub settings: NegotiatedSettings,
}

impl LinkNotice {
    pub fn store(&self, state_dir: &StateDir) -> Result<(), StateError> {
        state::write_json(&state_dir.path(LINK_FILE), self)
    }

    pub fn load(state_dir: &StateDir) -> Result<Option<Self>, StateError> {
        state::read_json(&state_dir.path(LINK_FILE))
    }

    /// Settings for `session_tag`, if its link is up
    pub fn for_session(
        state_dir: &StateDir,
        session_tag: &str,
    ) -> Result<Option<NegotiatedSettings>, StateError> {
        Ok(Self::load(state_dir)?
            .filter(|n| n.session_tag == session_tag)
            .map(|n| n.settings))
    }

    pub fn clear(state_dir: &StateDir) -> Result<bool, StateError> {
        state::remove(&state_dir.path(LINK_FILE))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub session_tag: String,
    pub requested_at: u64,
}

impl DisconnectRequest {
    pub fn new(session_tag: &str) -> Self {
        Self {
            session_tag: session_tag.to_string(),
            requested_at: state::unix_now(),
        }
    }

    pub fn store(&self, state_dir: &StateDir) -> Result<(), StateError> {
        state::write_json(&state_dir.path(DISCONNECT_FILE), self)
    }

    /// Consume a request addressed to `session_tag`
    pub fn take_for(state_dir: &StateDir, session_tag: &str) -> Result<bool, StateError> {
        let path = state_dir.path(DISCONNECT_FILE);
        let request: Option<DisconnectRequest> = state::read_json(&path)?;
        match request {
            Some(r) if r.session_tag == session_tag => {
                state::remove(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
