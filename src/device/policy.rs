//! Per-device handling policies
//!
//! A static table maps (vendor, product) to what must happen when the
//! device appears. Known decoys (virtual CD-ROM drives) are checked first
//! and always ignored. Entries from the config file take precedence over
//! the built-in table.
//!
//! Some modems expose several serial ports without saying which one
//! carries PPP; for those the table also fixes the data and control port.

use super::descriptor::DeviceDescriptor;
use serde::{Deserialize, Serialize};

/// Kernel driver to bind for a modem personality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverBinding {
    /// Module passed to modprobe
    pub module: String,
    /// `new_id` attribute relative to the sysfs root
    pub new_id: String,
}

/// Name the usb-serial core registers a module's driver under
///
/// `option` registers as `option1`; `sierra`, `qcserial` and the rest
/// use the module name.
pub fn usb_serial_driver(module: &str) -> String {
    match module {
        "option" => "option1".to_string(),
        other => other.to_string(),
    }
}

impl DriverBinding {
    /// Driver on the usb-serial bus (`option`, `sierra`, ...)
    pub fn usb_serial(module: &str) -> Self {
        Self::usb_serial_as(module, &usb_serial_driver(module))
    }

    /// usb-serial driver whose sysfs name is given explicitly
    pub fn usb_serial_as(module: &str, driver: &str) -> Self {
        Self {
            module: module.to_string(),
            new_id: format!("bus/usb-serial/drivers/{}/new_id", driver),
        }
    }

    /// Plain USB interface driver (`hso`)
    pub fn usb(module: &str) -> Self {
        Self {
            module: module.to_string(),
            new_id: format!("bus/usb/drivers/{}/new_id", module),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlingPolicy {
    /// Never touch the device and keep volume managers away from it
    Ignore,
    /// Driver binds without a mode switch
    DirectLoad(DriverBinding),
    /// Send a mode-switch request; the device re-enumerates under a new ID
    FlipThenLoad,
    /// Bind a driver, then run a vendor helper against the new personality
    VendorFollowUp {
        binding: DriverBinding,
        command: Vec<String>,
    },
}

/// Which of a modem's serial ports to dial on and to send AT commands to
///
/// Indices count the device's tty ports in interface order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub data: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<u8>,
}

/// Rule as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    pub vendor: u16,
    pub product: u16,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Sysfs driver name when it differs from the module's usual one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// `usb-serial` (default) or `usb`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    #[default]
    Ignore,
    Load,
    Flip,
    FollowUp,
}

impl PolicyRule {
    fn binding(&self) -> DriverBinding {
        let module = self.module.as_deref().unwrap_or("option");
        match (self.bus.as_deref(), self.driver.as_deref()) {
            (Some("usb"), _) => DriverBinding::usb(module),
            (_, Some(driver)) => DriverBinding::usb_serial_as(module, driver),
            (_, None) => DriverBinding::usb_serial(module),
        }
    }

    pub fn ports(&self) -> Option<PortAssignment> {
        self.data_port.map(|data| PortAssignment {
            data,
            control: self.control_port,
        })
    }

    pub fn to_policy(&self) -> HandlingPolicy {
        match self.action {
            RuleAction::Ignore => HandlingPolicy::Ignore,
            RuleAction::Load => HandlingPolicy::DirectLoad(self.binding()),
            RuleAction::Flip => HandlingPolicy::FlipThenLoad,
            RuleAction::FollowUp => HandlingPolicy::VendorFollowUp {
                binding: self.binding(),
                command: self.command.clone(),
            },
        }
    }
}

/// Virtual drives that must never be switched or mounted
const DECOY_DEVICES: &[(u16, u16)] = &[
    // Qualcomm ZeroCD, exposed alongside several vendors' modems
    (0x05c6, 0x1000),
];

#[derive(Clone, Copy)]
enum Builtin {
    Flip,
    Serial(&'static str),
    Usb(&'static str),
}

const BUILTIN_POLICIES: &[(u16, u16, Builtin)] = &[
    // Huawei
    (0x12d1, 0x1446, Builtin::Flip),
    (0x12d1, 0x1001, Builtin::Serial("option")), // K3520, K3715
    (0x12d1, 0x1003, Builtin::Serial("option")), // E220
    (0x12d1, 0x1004, Builtin::Serial("option")),
    // ZTE
    (0x19d2, 0x2000, Builtin::Flip),
    (0x19d2, 0x1008, Builtin::Serial("option")), // K3570-Z
    // Option
    (0x0af0, 0x6600, Builtin::Serial("option")), // GlobeSurfer Icon
    (0x0af0, 0x6901, Builtin::Usb("hso")),       // GT M378
    (0x0af0, 0x6911, Builtin::Usb("hso")),       // GT M378 NDIS
    // Novatel
    (0x1410, 0x5010, Builtin::Flip),
    (0x1410, 0x1450, Builtin::Serial("option")), // X950D
    (0x1410, 0x4400, Builtin::Serial("option")), // Ovation
];

/// Modems whose PPP port is not the first one
const BUILTIN_PORTS: &[(u16, u16, PortAssignment)] = &[
    // ZTE K3570-Z
    (0x19d2, 0x1008, PortAssignment { data: 3, control: Some(1) }),
    // Option GT M378 NDIS: 0 diagnostic, 1 application, 2 control, 3 modem
    (0x0af0, 0x6911, PortAssignment { data: 3, control: Some(1) }),
];

impl Builtin {
    fn to_policy(self) -> HandlingPolicy {
        match self {
            Builtin::Flip => HandlingPolicy::FlipThenLoad,
            Builtin::Serial(m) => HandlingPolicy::DirectLoad(DriverBinding::usb_serial(m)),
            Builtin::Usb(m) => HandlingPolicy::DirectLoad(DriverBinding::usb(m)),
        }
    }
}

/// Lookup table from (vendor, product) to policy
#[derive(Debug, Clone)]
pub struct PolicyTable {
    decoys: Vec<(u16, u16)>,
    entries: Vec<(u16, u16, HandlingPolicy)>,
    ports: Vec<(u16, u16, PortAssignment)>,
}

impl PolicyTable {
    /// Built-in table only
    pub fn builtin() -> Self {
        Self {
            decoys: DECOY_DEVICES.to_vec(),
            entries: BUILTIN_POLICIES
                .iter()
                .map(|&(v, p, b)| (v, p, b.to_policy()))
                .collect(),
            ports: BUILTIN_PORTS.to_vec(),
        }
    }

    /// Built-in table with config rules taking precedence
    pub fn with_rules(rules: &[PolicyRule]) -> Self {
        let mut table = Self::builtin();
        let mut entries: Vec<_> = rules
            .iter()
            .map(|r| (r.vendor, r.product, r.to_policy()))
            .collect();
        entries.append(&mut table.entries);
        table.entries = entries;

        let mut ports: Vec<_> = rules
            .iter()
            .filter_map(|r| r.ports().map(|a| (r.vendor, r.product, a)))
            .collect();
        ports.append(&mut table.ports);
        table.ports = ports;
        table
    }

    pub fn add_decoy(&mut self, vendor: u16, product: u16) {
        self.decoys.push((vendor, product));
    }

    pub fn is_decoy(&self, vendor: u16, product: u16) -> bool {
        self.decoys.contains(&(vendor, product))
    }

    /// Policy for a device, `None` if it is not a known modem
    pub fn lookup(&self, descriptor: &DeviceDescriptor) -> Option<HandlingPolicy> {
        if self.is_decoy(descriptor.vendor, descriptor.product) {
            return Some(HandlingPolicy::Ignore);
        }
        self.entries
            .iter()
            .find(|(v, p, _)| *v == descriptor.vendor && *p == descriptor.product)
            .map(|(_, _, policy)| policy.clone())
    }

    /// Fixed port layout for a device, `None` to use its first port
    pub fn ports(&self, descriptor: &DeviceDescriptor) -> Option<PortAssignment> {
        self.ports
            .iter()
            .find(|(v, p, _)| *v == descriptor.vendor && *p == descriptor.product)
            .map(|&(_, _, ports)| ports)
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}
