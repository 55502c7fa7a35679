//! Configuration handling for vmc-connect

use crate::device::policy::PolicyRule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

pub const CONFIG_FILE_NAME: &str = "vmc-connect.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dial: DialConfig,
    pub network: NetworkConfig,
    pub privileges: PrivilegeConfig,
    pub devices: DeviceConfig,
}

/// PPP dialing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    /// pppd executable
    pub ppp_binary: PathBuf,
    /// Peer profile under /etc/ppp/peers
    pub peer: String,
    /// Modem data port; dialing is refused while it is missing. Unset
    /// means the data port of the most recently handled modem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<PathBuf>,
    /// Seconds to wait for link-up before giving up
    pub timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when stopping pppd
    pub terminate_grace_secs: u64,
    /// Prefix of the session tag passed to pppd as `ipparam`
    pub tag_prefix: String,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            ppp_binary: PathBuf::from("/usr/sbin/pppd"),
            peer: "vmc".to_string(),
            device: None,
            timeout_secs: 60,
            terminate_grace_secs: 5,
            tag_prefix: "vmc-session".to_string(),
        }
    }
}

/// Whether the session may rewrite the resolver configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// Trust native management when the resolver file is a symlink
    Auto,
    /// Always write the resolver file for the session
    Override,
    /// Never touch the resolver file
    Native,
}

/// Host network state managed around a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub state_dir: PathBuf,
    pub resolv_conf: PathBuf,
    pub dns_mode: DnsMode,
    /// Used instead of the DNS servers negotiated by PPP when non-empty
    pub static_dns: Vec<std::net::IpAddr>,
    pub replace_default_route: bool,
    /// Command that makes a local name cache reload, e.g. `nscd -i hosts`
    pub cache_reload: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(crate::state::DEFAULT_STATE_DIR),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            dns_mode: DnsMode::Auto,
            static_dns: Vec::new(),
            replace_default_route: true,
            cache_reload: vec!["nscd".to_string(), "-i".to_string(), "hosts".to_string()],
        }
    }
}

/// Permission toggling on the PPP binary and credential files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    pub enabled: bool,
    pub ppp_binary: PathBuf,
    pub credential_files: Vec<PathBuf>,
    /// Group allowed to read credentials while dialing
    pub dial_group: Option<String>,
    pub binary_idle_mode: u32,
    pub binary_dial_mode: u32,
    pub credentials_idle_mode: u32,
    pub credentials_dial_mode: u32,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ppp_binary: PathBuf::from("/usr/sbin/pppd"),
            credential_files: vec![
                PathBuf::from("/etc/ppp/chap-secrets"),
                PathBuf::from("/etc/ppp/pap-secrets"),
                PathBuf::from("/etc/ppp/peers/vmc"),
            ],
            dial_group: Some("dip".to_string()),
            binary_idle_mode: 0o755,
            binary_dial_mode: 0o4755,
            credentials_idle_mode: 0o600,
            credentials_dial_mode: 0o640,
        }
    }
}

/// USB mode-switch handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub mode_switch_helper: PathBuf,
    pub helper_timeout_secs: u64,
    /// Duplicate add-events for a bus path within this window are dropped
    pub suppress_window_secs: u64,
    pub sysfs_root: PathBuf,
    pub modprobe: Option<PathBuf>,
    /// Extra rules, consulted before the built-in table
    pub policy: Vec<PolicyRule>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mode_switch_helper: PathBuf::from("/usr/sbin/usb_modeswitch"),
            helper_timeout_secs: 20,
            suppress_window_secs: 10,
            sysfs_root: PathBuf::from("/sys"),
            modprobe: Some(PathBuf::from("/sbin/modprobe")),
            policy: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from an explicit path, or the first default location that exists
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            debug!("Loading config from {}", path.display());
            return Self::load(path);
        }

        for candidate in Self::search_paths() {
            if candidate.exists() {
                debug!("Loading config from {}", candidate.display());
                return Self::load(&candidate);
            }
        }

        info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("vmc-connect").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_round_trips_through_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        Config::default().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.dial.peer, "vmc");
        assert_eq!(loaded.network.dns_mode, DnsMode::Auto);
        assert_eq!(loaded.privileges.binary_dial_mode, 0o4755);
        assert_eq!(loaded.devices.suppress_window_secs, 10);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[network]\ndns_mode = \"native\"\nstatic_dns = [\"9.9.9.9\"]\n",
        )
        .unwrap();

        let config = Config::discover(Some(&path)).unwrap();

        assert_eq!(config.network.dns_mode, DnsMode::Native);
        assert_eq!(config.network.static_dns.len(), 1);
        assert_eq!(config.network.resolv_conf, PathBuf::from("/etc/resolv.conf"));
        assert_eq!(config.dial.timeout_secs, 60);
    }

    #[test]
    fn test_policy_rules_parse() {
        let text = r#"
[[devices.policy]]
vendor = 0x1199
product = 0x0fff
action = "flip"

[[devices.policy]]
vendor = 0x1199
product = 0x6880
action = "load"
module = "sierra"
data_port = 3
control_port = 1
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.devices.policy.len(), 2);
        assert_eq!(config.devices.policy[1].module.as_deref(), Some("sierra"));
        assert_eq!(config.devices.policy[1].ports().map(|p| p.data), Some(3));
        assert!(config.dial.device.is_none());
    }

    #[test]
    fn test_explicit_dial_device() {
        let config: Config = toml::from_str("[dial]\ndevice = \"/dev/ttyACM0\"\n").unwrap();
        assert_eq!(config.dial.device, Some(PathBuf::from("/dev/ttyACM0")));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[dial\npeer = ").unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
