//! Devices currently being handled
//!
//! udev starts a fresh process per event, so the set of handled devices
//! lives on disk: one record per bus path under `<state_dir>/devices`.
//! A record suppresses further add-events for the same bus path and
//! product ID until the suppression window passes or the device is removed.
//! Records also tell `connect` which modem is plugged in and which of its
//! ports to dial on.

use super::descriptor::DeviceDescriptor;
use super::policy::PortAssignment;
use crate::state::{self, StateError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandledRecord {
    pub vendor: u16,
    pub product: u16,
    pub handled_at: u64,
    #[serde(default)]
    pub bus_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortAssignment>,
}

pub struct DeviceRegistry {
    dir: PathBuf,
    window_secs: u64,
}

impl DeviceRegistry {
    pub fn new(state_dir: &state::StateDir, window_secs: u64) -> Self {
        Self {
            dir: state_dir.path("devices"),
            window_secs,
        }
    }

    fn record_path(&self, bus_path: &str) -> PathBuf {
        let name: String = bus_path
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    /// Mark `descriptor` as handled at `now`
    ///
    /// Returns `false` when the same device (bus path and product ID) was
    /// already claimed within the suppression window.
    pub fn claim(
        &self,
        descriptor: &DeviceDescriptor,
        ports: Option<PortAssignment>,
        now: u64,
    ) -> Result<bool, StateError> {
        let path = self.record_path(&descriptor.bus_path);
        let record = HandledRecord {
            vendor: descriptor.vendor,
            product: descriptor.product,
            handled_at: now,
            bus_path: descriptor.bus_path.clone(),
            ports,
        };

        for _ in 0..2 {
            if state::create_json_exclusive(&path, &record)? {
                return Ok(true);
            }

            let Some(existing) = state::read_json::<HandledRecord>(&path)? else {
                continue;
            };

            if self.suppresses(&existing, descriptor, now) {
                debug!(
                    "Suppressing duplicate event for {} (handled {}s ago)",
                    descriptor,
                    now.saturating_sub(existing.handled_at)
                );
                return Ok(false);
            }

            // Expired or a different personality: take the record over
            let stale = state::StateDir::temp_path(&path.with_extension("stale"));
            if state::claim(&path, &stale)? {
                state::remove(&stale)?;
            }
        }

        Ok(false)
    }

    fn suppresses(&self, existing: &HandledRecord, descriptor: &DeviceDescriptor, now: u64) -> bool {
        existing.vendor == descriptor.vendor
            && existing.product == descriptor.product
            && now.saturating_sub(existing.handled_at) < self.window_secs
    }

    /// Drop the record for a removed device
    pub fn forget(&self, bus_path: &str) -> Result<bool, StateError> {
        state::remove(&self.record_path(bus_path))
    }

    pub fn get(&self, bus_path: &str) -> Result<Option<HandledRecord>, StateError> {
        state::read_json(&self.record_path(bus_path))
    }

    /// Every handled device, most recently handled first
    pub fn records(&self) -> Result<Vec<HandledRecord>, StateError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::IoError {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match state::read_json::<HandledRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => debug!("Skipping unreadable device record: {}", e),
            }
        }
        records.sort_by(|a, b| b.handled_at.cmp(&a.handled_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> DeviceRegistry {
        DeviceRegistry::new(&state::StateDir::new(dir.path()), 10)
    }

    #[test]
    fn test_first_claim_succeeds() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let d = DeviceDescriptor::new(0x12d1, 0x1446, 1, "1-2");

        assert!(reg.claim(&d, None, 1000).unwrap());
        assert_eq!(reg.get("1-2").unwrap().unwrap().product, 0x1446);
    }

    #[test]
    fn test_duplicate_within_window_suppressed() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let d = DeviceDescriptor::new(0x12d1, 0x1446, 1, "1-2");

        assert!(reg.claim(&d, None, 1000).unwrap());
        assert!(!reg.claim(&d, None, 1005).unwrap());
    }

    #[test]
    fn test_duplicate_after_window_handled_again() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let d = DeviceDescriptor::new(0x12d1, 0x1446, 1, "1-2");

        assert!(reg.claim(&d, None, 1000).unwrap());
        assert!(reg.claim(&d, None, 1010).unwrap());
        assert_eq!(reg.get("1-2").unwrap().unwrap().handled_at, 1010);
    }

    #[test]
    fn test_new_product_on_same_path_handled() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        let storage = DeviceDescriptor::new(0x12d1, 0x1446, 1, "1-2");
        let modem = DeviceDescriptor::new(0x12d1, 0x1001, 3, "1-2");

        assert!(reg.claim(&storage, None, 1000).unwrap());
        assert!(reg.claim(&modem, None, 1001).unwrap());
    }

    #[test]
    fn test_records_keep_port_assignment() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let ports = PortAssignment {
            data: 3,
            control: Some(1),
        };

        let older = DeviceDescriptor::new(0x12d1, 0x1003, 2, "1-1");
        let newer = DeviceDescriptor::new(0x19d2, 0x1008, 4, "2-1.4");
        assert!(reg.claim(&older, None, 1000).unwrap());
        assert!(reg.claim(&newer, Some(ports), 2000).unwrap());

        let records = reg.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bus_path, "2-1.4");
        assert_eq!(records[0].ports, Some(ports));
        assert_eq!(records[1].ports, None);
    }

    #[test]
    fn test_records_without_devices_dir() {
        let dir = TempDir::new().unwrap();
        assert!(registry(&dir).records().unwrap().is_empty());
    }

    #[test]
    fn test_forget_clears_record() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let d = DeviceDescriptor::new(0x19d2, 0x2000, 1, "3-1.2");

        assert!(reg.claim(&d, None, 1000).unwrap());
        assert!(reg.forget("3-1.2").unwrap());
        assert!(reg.claim(&d, None, 1001).unwrap());
        assert!(!reg.forget("9-9").unwrap());
    }
}
