//! Linux-specific routing implementation

use super::{DefaultRoute, PlatformError, RoutingManager};
use std::process::Command;

pub struct LinuxRoutingManager;

impl LinuxRoutingManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the first line of `ip -4 route show default`
pub fn parse_default_route(output: &str) -> Option<DefaultRoute> {
    let line = output.lines().find(|l| l.trim_start().starts_with("default"))?;
    let mut gateway = None;
    let mut device = None;

    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        match word {
            "via" => gateway = words.next().and_then(|w| w.parse().ok()),
            "dev" => device = words.next().map(str::to_string),
            _ => {}
        }
    }

    if gateway.is_none() && device.is_none() {
        return None;
    }
    Some(DefaultRoute { gateway, device })
}

impl RoutingManager for LinuxRoutingManager {
    fn default_route(&self) -> Result<Option<DefaultRoute>, PlatformError> {
        let output = Command::new("ip")
            .args(["-4", "route", "show", "default"])
            .output()
            .map_err(|e| PlatformError::QueryRouteError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::QueryRouteError(stderr.to_string()));
        }

        Ok(parse_default_route(&String::from_utf8_lossy(&output.stdout)))
    }

    fn set_default_route(&self, route: &DefaultRoute) -> Result<(), PlatformError> {
        let output = Command::new("ip")
            .args(["route", "replace", "default"])
            .args(route.ip_args())
            .output()
            .map_err(|e| PlatformError::AddRouteError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::AddRouteError(stderr.to_string()));
        }

        Ok(())
    }

    fn delete_default_route(&self, route: &DefaultRoute) -> Result<(), PlatformError> {
        let output = Command::new("ip")
            .args(["route", "delete", "default"])
            .args(route.ip_args())
            .output()
            .map_err(|e| PlatformError::DeleteRouteError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::DeleteRouteError(stderr.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway_route() {
        let out = "default via 192.168.1.1 dev wlan0 proto dhcp metric 600\n";
        let route = parse_default_route(out).unwrap();
        assert_eq!(route.gateway.unwrap().to_string(), "192.168.1.1");
        assert_eq!(route.device.as_deref(), Some("wlan0"));
    }

    #[test]
    fn test_parse_device_route() {
        let route = parse_default_route("default dev ppp0 scope link \n").unwrap();
        assert_eq!(route, DefaultRoute::via_device("ppp0"));
    }

    #[test]
    fn test_parse_no_default() {
        assert!(parse_default_route("").is_none());
        assert!(parse_default_route("10.0.0.0/8 dev eth0 scope link\n").is_none());
    }
}
