//! Hypervisor drivers.
//!
//! One [`Driver`] is selected per process from the [`HostPlatform`] and
//! never reselected. Backends share no code, only the contract.

pub mod hyperkit;
pub mod hyperv;
pub mod kvm;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SystemConfig;
use crate::daemon::DaemonRunner;
use crate::error::CfdevError;

/// Host operating systems with a hypervisor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    MacOs,
    Windows,
    Linux,
}

impl HostPlatform {
    /// Map a `std::env::consts::OS` value to a platform.
    pub fn from_os(os: &str) -> Option<Self> {
        match os {
            "macos" => Some(HostPlatform::MacOs),
            "windows" => Some(HostPlatform::Windows),
            "linux" => Some(HostPlatform::Linux),
            _ => None,
        }
    }

    pub fn current() -> Option<Self> {
        Self::from_os(std::env::consts::OS)
    }
}

/// Sizing and boot media handed to [`Driver::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub cpus: u32,
    pub memory_mb: u64,
    /// Verified boot image in the resource cache.
    pub image: PathBuf,
    /// Cache directory, for backends that need further assets (firmware).
    pub assets_dir: PathBuf,
}

impl VmConfig {
    pub fn from_system(sys_config: &SystemConfig) -> Result<Self, CfdevError> {
        Ok(Self {
            cpus: sys_config.config.vm.cpus,
            memory_mb: sys_config.config.vm.memory_mb,
            image: sys_config.image_path()?,
            assets_dir: sys_config.cache_dir(),
        })
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare host networking for the VM. Idempotent.
    async fn setup_networking(&self) -> Result<(), CfdevError>;

    /// Release whatever `setup_networking` started, whether or not the VM
    /// ever booted. Idempotent.
    async fn teardown_networking(&self) -> Result<(), CfdevError> {
        Ok(())
    }

    /// Boot the VM. Returns immediately when it is already running.
    async fn start(&self, vm: &VmConfig) -> Result<(), CfdevError>;

    /// Halt the VM. Succeeds when it is already stopped.
    async fn stop(&self) -> Result<(), CfdevError>;

    async fn is_running(&self) -> Result<bool, CfdevError>;

    /// Halt the VM and remove its backend state. Succeeds when absent.
    async fn destroy(&self) -> Result<(), CfdevError>;
}

/// Stand-in for hosts without a backend; every operation is rejected.
pub struct NoDriver {
    os: String,
}

impl NoDriver {
    fn unsupported(&self) -> CfdevError {
        CfdevError::UnsupportedPlatform {
            os: self.os.clone(),
        }
    }
}

#[async_trait]
impl Driver for NoDriver {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn setup_networking(&self) -> Result<(), CfdevError> {
        Err(self.unsupported())
    }

    async fn start(&self, _vm: &VmConfig) -> Result<(), CfdevError> {
        Err(self.unsupported())
    }

    async fn stop(&self) -> Result<(), CfdevError> {
        Err(self.unsupported())
    }

    async fn is_running(&self) -> Result<bool, CfdevError> {
        Err(self.unsupported())
    }

    async fn destroy(&self) -> Result<(), CfdevError> {
        Err(self.unsupported())
    }
}

/// Build the driver for `platform`. `None` yields a [`NoDriver`] that
/// rejects every call with `UnsupportedPlatform`.
pub fn select_driver(
    platform: Option<HostPlatform>,
    sys_config: &SystemConfig,
    daemons: Arc<dyn DaemonRunner>,
) -> Box<dyn Driver> {
    match platform {
        Some(HostPlatform::MacOs) => Box::new(hyperkit::HyperkitDriver::new(sys_config, daemons)),
        Some(HostPlatform::Windows) => Box::new(hyperv::HyperVDriver::new(
            sys_config,
            Arc::new(hyperv::SystemPowerShell),
            hyperv::TopologyIds::DEFAULT,
        )),
        Some(HostPlatform::Linux) => Box::new(kvm::KvmDriver::new(sys_config, daemons)),
        None => Box::new(NoDriver {
            os: std::env::consts::OS.to_string(),
        }),
    }
}
