//! udev event parsing
//!
//! udev runs `vmc-connect device` from a rule with the event described in
//! environment variables. This module turns them into a [`DeviceEvent`].
//!
//! # Key Variables
//!
//! | Variable | Example | Description |
//! |----------|---------|-------------|
//! | `ACTION` | `add` | Event kind |
//! | `DEVPATH` | `/devices/pci0000:00/0000:00:1d.7/usb1/1-2` | sysfs path |
//! | `PRODUCT` | `12d1/1446/0` | Hex vendor/product/bcdDevice |
//! | `DEVTYPE` | `usb_device` | `usb_device` or `usb_interface` |

use std::env;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UdevEnvError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid PRODUCT value: {0}")]
    InvalidProduct(String),
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),
}

/// Identifies a physical USB modem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor: u16,
    pub product: u16,
    pub interfaces: u8,
    /// Port path on the bus, e.g. `1-2.3`
    pub bus_path: String,
}

impl DeviceDescriptor {
    pub fn new(vendor: u16, product: u16, interfaces: u8, bus_path: impl Into<String>) -> Self {
        Self {
            vendor,
            product,
            interfaces,
            bus_path: bus_path.into(),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} at {} ({} interfaces)",
            self.vendor, self.product, self.bus_path, self.interfaces
        )
    }
}

/// A USB enumeration event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Add(DeviceDescriptor),
    Remove { bus_path: String },
}

impl DeviceEvent {
    /// Parse the event udev passed in the current process environment
    pub fn from_env(sysfs_root: &Path) -> Result<Self, UdevEnvError> {
        Self::from_env_fn(
            |key| env::var(key),
            |devpath| read_interface_count(sysfs_root, devpath),
        )
    }

    /// Parse using custom getters (for testing)
    pub fn from_env_fn<F, I>(get_var: F, interface_count: I) -> Result<Self, UdevEnvError>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
        I: Fn(&str) -> Option<u8>,
    {
        let action = get_var("ACTION").map_err(|_| UdevEnvError::MissingVar("ACTION".into()))?;
        let devpath =
            get_var("DEVPATH").map_err(|_| UdevEnvError::MissingVar("DEVPATH".into()))?;
        let bus_path = bus_path_from_devpath(&devpath);

        match action.as_str() {
            "add" => {
                let product_str =
                    get_var("PRODUCT").map_err(|_| UdevEnvError::MissingVar("PRODUCT".into()))?;
                let (vendor, product) = parse_product(&product_str)?;
                let interfaces = interface_count(&device_devpath(&devpath)).unwrap_or(0);
                Ok(DeviceEvent::Add(DeviceDescriptor {
                    vendor,
                    product,
                    interfaces,
                    bus_path,
                }))
            }
            "remove" => Ok(DeviceEvent::Remove { bus_path }),
            other => Err(UdevEnvError::UnsupportedAction(other.to_string())),
        }
    }
}

/// Parse udev's `PRODUCT` (`vvvv/pppp/dddd`, hex without padding)
pub fn parse_product(value: &str) -> Result<(u16, u16), UdevEnvError> {
    let invalid = || UdevEnvError::InvalidProduct(value.to_string());
    let mut parts = value.split('/');
    let vendor = parts.next().ok_or_else(invalid)?;
    let product = parts.next().ok_or_else(invalid)?;
    let vendor = u16::from_str_radix(vendor, 16).map_err(|_| invalid())?;
    let product = u16::from_str_radix(product, 16).map_err(|_| invalid())?;
    Ok((vendor, product))
}

/// Bus path of the USB device an event belongs to
///
/// Interface events (`1-2:1.0`) collapse onto their parent device (`1-2`),
/// so overlapping events for a multi-interface modem share one key.
pub fn bus_path_from_devpath(devpath: &str) -> String {
    let last = devpath.rsplit('/').next().unwrap_or(devpath);
    last.split(':').next().unwrap_or(last).to_string()
}

/// DEVPATH of the device itself when the event is for one of its interfaces
fn device_devpath(devpath: &str) -> String {
    match devpath.rsplit_once('/') {
        Some((parent, last)) if last.contains(':') => parent.to_string(),
        _ => devpath.to_string(),
    }
}

fn read_interface_count(sysfs_root: &Path, devpath: &str) -> Option<u8> {
    let path = sysfs_root
        .join(devpath.trim_start_matches('/'))
        .join("bNumInterfaces");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
