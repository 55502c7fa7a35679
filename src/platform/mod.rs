//! Platform-specific implementations

#[cfg(target_os = "linux")]
pub mod linux;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to query routes: {0}")]
    QueryRouteError(String),
    #[error("Failed to add route: {0}")]
    AddRouteError(String),
    #[error("Failed to delete route: {0}")]
    DeleteRouteError(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// A default route, by gateway and/or outgoing device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoute {
    pub gateway: Option<IpAddr>,
    pub device: Option<String>,
}

impl DefaultRoute {
    /// Point-to-point route through an interface, e.g. `ppp0`
    pub fn via_device(device: &str) -> Self {
        Self {
            gateway: None,
            device: Some(device.to_string()),
        }
    }

    /// Arguments after `ip route <verb> default`
    pub fn ip_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(gateway) = self.gateway {
            args.push("via".to_string());
            args.push(gateway.to_string());
        }
        if let Some(ref device) = self.device {
            args.push("dev".to_string());
            args.push(device.clone());
        }
        args
    }
}

impl fmt::Display for DefaultRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.gateway, &self.device) {
            (Some(gw), Some(dev)) => write!(f, "via {} dev {}", gw, dev),
            (Some(gw), None) => write!(f, "via {}", gw),
            (None, Some(dev)) => write!(f, "dev {}", dev),
            (None, None) => write!(f, "(none)"),
        }
    }
}

/// Platform-agnostic default route interface
pub trait RoutingManager: Send {
    /// Current IPv4 default route, if any
    fn default_route(&self) -> Result<Option<DefaultRoute>, PlatformError>;
    /// Install `route` as the default, replacing any existing one
    fn set_default_route(&self, route: &DefaultRoute) -> Result<(), PlatformError>;
    fn delete_default_route(&self, route: &DefaultRoute) -> Result<(), PlatformError>;
}

/// Get the appropriate routing manager for the current platform
pub fn get_routing_manager() -> Result<Box<dyn RoutingManager>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxRoutingManager::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}
