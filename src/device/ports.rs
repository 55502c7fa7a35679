//! Serial port discovery for handled modems
//!
//! A modem bound to `option` or `hso` shows up as several tty devices under
//! its USB interfaces:
//!
//! ```text
//! /sys/bus/usb/devices/2-1/2-1:1.0/ttyUSB0        usb-serial
//! /sys/bus/usb/devices/2-1/2-1:1.3/tty/ttyHS3     hso, cdc-acm
//! ```
//!
//! Ports are numbered in that order, and a device's [`PortAssignment`]
//! picks the one pppd dials on. Without an assignment the first port is
//! used.

use super::registry::{DeviceRegistry, HandledRecord};
use crate::config::Config;
use crate::state::StateDir;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Dialed when no modem has been seen and none is configured
pub const FALLBACK_DEVICE: &str = "/dev/ttyUSB0";

/// tty names of the device at `bus_path`, in port order
pub fn tty_ports(sysfs_root: &Path, bus_path: &str) -> Vec<String> {
    let device = sysfs_root.join("bus/usb/devices").join(bus_path);
    let Ok(entries) = fs::read_dir(&device) else {
        return Vec::new();
    };

    let interface_prefix = format!("{}:", bus_path);
    let mut ports = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&interface_prefix) {
            ports.extend(interface_ttys(&entry.path()));
        }
    }
    ports.sort_by(|a, b| port_key(a).cmp(&port_key(b)));
    ports
}

fn interface_ttys(interface: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(interface) else {
        return Vec::new();
    };

    let mut ttys = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "tty" {
            if let Ok(class) = fs::read_dir(entry.path()) {
                ttys.extend(
                    class
                        .flatten()
                        .map(|e| e.file_name().to_string_lossy().into_owned()),
                );
            }
        } else if name.starts_with("tty") {
            ttys.push(name);
        }
    }
    ttys
}

/// `ttyUSB10` sorts after `ttyUSB9`
fn port_key(name: &str) -> (&str, u32) {
    let split = name
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(name.len());
    let (prefix, number) = name.split_at(split);
    (prefix, number.parse().unwrap_or(0))
}

/// The port pppd should dial on for a handled device
pub fn data_port(sysfs_root: &Path, record: &HandledRecord) -> Option<PathBuf> {
    let index = record.ports.map(|p| p.data as usize).unwrap_or(0);
    let ports = tty_ports(sysfs_root, &record.bus_path);
    match ports.get(index) {
        Some(name) => Some(Path::new("/dev").join(name)),
        None => {
            debug!(
                "{:04x}:{:04x} at {} has {} ports, wanted port {}",
                record.vendor,
                record.product,
                record.bus_path,
                ports.len(),
                index
            );
            None
        }
    }
}

/// Device to dial: configured, else the newest handled modem's data port
pub fn resolve_dial_device(config: &Config) -> PathBuf {
    if let Some(ref device) = config.dial.device {
        return device.clone();
    }

    let registry = DeviceRegistry::new(
        &StateDir::new(&config.network.state_dir),
        config.devices.suppress_window_secs,
    );
    let records = match registry.records() {
        Ok(records) => records,
        Err(e) => {
            debug!("Could not list handled devices: {}", e);
            Vec::new()
        }
    };

    for record in records.iter().filter(|r| !r.bus_path.is_empty()) {
        if let Some(port) = data_port(&config.devices.sysfs_root, record) {
            info!(
                "Using {} of {:04x}:{:04x}",
                port.display(),
                record.vendor,
                record.product
            );
            return port;
        }
    }

    debug!("No handled modem found, falling back to {}", FALLBACK_DEVICE);
    PathBuf::from(FALLBACK_DEVICE)
}
