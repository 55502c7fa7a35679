//! Mode-switch orchestration
//!
//! Turns udev events into at most one action per physical insertion:
//!
//! 1. Look up the handling policy for the device
//! 2. Suppress duplicates via the [`DeviceRegistry`]
//! 3. Run the mode-switch helper or bind the driver
//!
//! Helper failures are logged and the device is left unbound. The registry
//! record is kept, so a failing device is not retried until it is replugged.

use super::descriptor::{DeviceDescriptor, DeviceEvent};
use super::policy::{DriverBinding, HandlingPolicy, PolicyTable};
use super::registry::DeviceRegistry;
use super::DeviceError;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// What to do for an add-event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Unknown device or duplicate event
    Nothing,
    /// Decoy: keep volume managers from mounting it
    Ignore { bus_path: String },
    ModeSwitch { vendor: u16, product: u16 },
    BindDriver {
        vendor: u16,
        product: u16,
        binding: DriverBinding,
    },
    BindAndFollowUp {
        vendor: u16,
        product: u16,
        binding: DriverBinding,
        command: Vec<String>,
    },
}

impl Action {
    /// Properties printed for udev's `IMPORT{program}`
    pub fn udev_properties(&self) -> &'static [&'static str] {
        match self {
            Action::Ignore { .. } => &["UDISKS_IGNORE=1", "UDISKS_PRESENTATION_HIDE=1"],
            _ => &[],
        }
    }
}

/// Side effects of device handling
#[allow(async_fn_in_trait)]
pub trait DeviceBackend {
    /// Run an external helper and wait for it, bounded by the backend timeout
    async fn run_helper(&self, program: &Path, args: &[String]) -> Result<(), DeviceError>;

    /// Load a kernel module
    async fn load_module(&self, module: &str) -> Result<(), DeviceError>;

    /// Write `line` to a sysfs attribute relative to the sysfs root
    fn write_sysfs(&self, attribute: &str, line: &str) -> Result<(), DeviceError>;
}

/// Backend running real processes and writing to /sys
pub struct SystemBackend {
    timeout: Duration,
    sysfs_root: PathBuf,
    modprobe: Option<PathBuf>,
}

impl SystemBackend {
    pub fn new(timeout: Duration, sysfs_root: PathBuf, modprobe: Option<PathBuf>) -> Self {
        Self {
            timeout,
            sysfs_root,
            modprobe,
        }
    }
}

impl DeviceBackend for SystemBackend {
    async fn run_helper(&self, program: &Path, args: &[String]) -> Result<(), DeviceError> {
        let name = program.display().to_string();
        debug!("Running {} {:?}", name, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeviceError::SpawnFailed {
                program: name.clone(),
                source,
            })?;

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status.map_err(|source| DeviceError::SpawnFailed {
                program: name.clone(),
                source,
            })?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(DeviceError::HelperTimeout {
                    program: name,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !status.success() {
            return Err(DeviceError::HelperFailed {
                program: name,
                code: status.code(),
            });
        }
        Ok(())
    }

    async fn load_module(&self, module: &str) -> Result<(), DeviceError> {
        match &self.modprobe {
            Some(modprobe) => self.run_helper(modprobe, &[module.to_string()]).await,
            None => Ok(()),
        }
    }

    fn write_sysfs(&self, attribute: &str, line: &str) -> Result<(), DeviceError> {
        let path = self.sysfs_root.join(attribute);
        match std::fs::write(&path, format!("{}\n", line)) {
            Ok(()) => Ok(()),
            // The ID is already in the driver's table
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(source) => Err(DeviceError::BindFailed { path, source }),
        }
    }
}

pub struct ModeSwitchOrchestrator<B> {
    table: PolicyTable,
    registry: DeviceRegistry,
    backend: B,
    helper: PathBuf,
}

impl<B: DeviceBackend> ModeSwitchOrchestrator<B> {
    pub fn new(table: PolicyTable, registry: DeviceRegistry, backend: B, helper: PathBuf) -> Self {
        Self {
            table,
            registry,
            backend,
            helper,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Decide what an add-event calls for, claiming the device if needed
    pub fn handle_add_event(
        &self,
        descriptor: &DeviceDescriptor,
        now: u64,
    ) -> Result<Action, DeviceError> {
        let Some(policy) = self.table.lookup(descriptor) else {
            debug!("No policy for {}, ignoring event", descriptor);
            return Ok(Action::Nothing);
        };

        if policy == HandlingPolicy::Ignore {
            info!("Ignoring decoy device {}", descriptor);
            return Ok(Action::Ignore {
                bus_path: descriptor.bus_path.clone(),
            });
        }

        let ports = self.table.ports(descriptor);
        if !self.registry.claim(descriptor, ports, now)? {
            return Ok(Action::Nothing);
        }

        let vendor = descriptor.vendor;
        let product = descriptor.product;
        Ok(match policy {
            HandlingPolicy::Ignore => Action::Nothing,
            HandlingPolicy::FlipThenLoad => Action::ModeSwitch { vendor, product },
            HandlingPolicy::DirectLoad(binding) => Action::BindDriver {
                vendor,
                product,
                binding,
            },
            HandlingPolicy::VendorFollowUp { binding, command } => Action::BindAndFollowUp {
                vendor,
                product,
                binding,
                command,
            },
        })
    }

    /// Carry out an action
    pub async fn execute(&self, action: &Action) -> Result<(), DeviceError> {
        match action {
            Action::Nothing | Action::Ignore { .. } => Ok(()),
            Action::ModeSwitch { vendor, product } => {
                info!("Switching {:04x}:{:04x} to modem mode", vendor, product);
                let args = vec![
                    "-v".to_string(),
                    format!("0x{:04x}", vendor),
                    "-p".to_string(),
                    format!("0x{:04x}", product),
                ];
                self.backend.run_helper(&self.helper, &args).await
            }
            Action::BindDriver {
                vendor,
                product,
                binding,
            } => self.bind(*vendor, *product, binding).await,
            Action::BindAndFollowUp {
                vendor,
                product,
                binding,
                command,
            } => {
                self.bind(*vendor, *product, binding).await?;
                let Some((program, args)) = command.split_first() else {
                    return Ok(());
                };
                info!("Running follow-up {} for {:04x}:{:04x}", program, vendor, product);
                self.backend.run_helper(Path::new(program), args).await
            }
        }
    }

    async fn bind(&self, vendor: u16, product: u16, binding: &DriverBinding) -> Result<(), DeviceError> {
        info!(
            "Binding {:04x}:{:04x} to driver {}",
            vendor, product, binding.module
        );
        self.backend.load_module(&binding.module).await?;
        self.backend
            .write_sysfs(&binding.new_id, &format!("{:04x} {:04x}", vendor, product))
    }

    /// Handle one udev event end to end
    ///
    /// Only state-file errors are returned; helper and binding failures are
    /// logged and leave the device unhandled.
    pub async fn handle(&self, event: &DeviceEvent, now: u64) -> Result<Action, DeviceError> {
        match event {
            DeviceEvent::Add(descriptor) => {
                let action = self.handle_add_event(descriptor, now)?;
                if let Err(e) = self.execute(&action).await {
                    warn!("Failed to handle {}: {} (leaving device unbound)", descriptor, e);
                }
                Ok(action)
            }
            DeviceEvent::Remove { bus_path } => {
                if self.registry.forget(bus_path)? {
                    info!("Device at {} removed", bus_path);
                }
                Ok(Action::Nothing)
            }
        }
    }
}
