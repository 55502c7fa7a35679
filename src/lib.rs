//! vmc-connect - USB mobile broadband modem lifecycle controller
//!
//! Takes a USB 3G/4G modem from "just plugged in" to "dialed and routed"
//! and back: switches modems out of their storage personality, dials with
//! pppd under a host-wide lock, and puts the host's route and resolver
//! configuration back exactly as it was when the session ends.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `device`: udev event handling and mode switching
//! - `session`: Connection lock, session state machine and pppd driver
//! - `network`: Snapshot/override/restore of route and DNS state
//! - `privilege`: Dial privileges on the PPP binary and credentials
//! - `hook`: pppd ip-up/ip-down integration
//! - `platform`: Default route management
//! - `state`: Persistent state for crash recovery
//!
//! # Usage
//!
//! ```bash
//! sudo vmc-connect connect
//! sudo vmc-connect disconnect
//! ```

#[cfg(not(unix))]
compile_error!("vmc-connect drives pppd and udev and only builds on Unix");

pub mod config;
pub mod device;
pub mod hook;
pub mod network;
pub mod platform;
pub mod privilege;
pub mod session;
pub mod state;

pub use config::Config;
pub use device::handle_device_mode;
pub use hook::handle_hook_mode;
pub use session::{run_session, ConnectFailure, SessionContext, SessionOutcome};
