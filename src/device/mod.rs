//! USB modem detection and mode switching
//!
//! Invoked by udev for every add/remove event of a USB device:
//!
//! ```text
//! ACTION=="add|remove", SUBSYSTEM=="usb", ENV{DEVTYPE}=="usb_device", \
//!   IMPORT{program}="/usr/bin/vmc-connect device"
//! ```
//!
//! Device handling never affects sessions: a device that fails to switch is
//! simply not available for dialing.

pub mod descriptor;
pub mod orchestrator;
pub mod policy;
pub mod ports;
pub mod registry;

pub use descriptor::{DeviceDescriptor, DeviceEvent, UdevEnvError};
pub use orchestrator::{Action, DeviceBackend, ModeSwitchOrchestrator, SystemBackend};
pub use policy::{HandlingPolicy, PolicyTable, PortAssignment};
pub use ports::resolve_dial_device;
pub use registry::DeviceRegistry;

use crate::config::Config;
use crate::state::{StateDir, StateError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with status {code:?}")]
    HelperFailed { program: String, code: Option<i32> },
    #[error("{program} timed out after {secs}s")]
    HelperTimeout { program: String, secs: u64 },
    #[error("Failed to bind driver via {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("udev environment error: {0}")]
    EnvError(#[from] UdevEnvError),
    #[error("State error: {0}")]
    StateError(#[from] StateError),
}

/// Build the orchestrator described by `config`
pub fn orchestrator_from_config(config: &Config) -> ModeSwitchOrchestrator<SystemBackend> {
    let state_dir = StateDir::new(&config.network.state_dir);
    let devices = &config.devices;
    ModeSwitchOrchestrator::new(
        PolicyTable::with_rules(&devices.policy),
        DeviceRegistry::new(&state_dir, devices.suppress_window_secs),
        SystemBackend::new(
            Duration::from_secs(devices.helper_timeout_secs),
            devices.sysfs_root.clone(),
            devices.modprobe.clone(),
        ),
        devices.mode_switch_helper.clone(),
    )
}

/// Entry point for `vmc-connect device`
///
/// Parses the udev event from the environment and handles it. Returns the
/// action taken so the caller can print udev properties.
pub async fn handle_device_mode(config: &Config) -> Result<Action, DeviceError> {
    let event = DeviceEvent::from_env(&config.devices.sysfs_root)?;
    info!("Device event: {:?}", event);

    let orchestrator = orchestrator_from_config(config);
    orchestrator
        .handle(&event, crate::state::unix_now())
        .await
}
