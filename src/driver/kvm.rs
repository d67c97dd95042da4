//! Linux backend: QEMU with KVM acceleration, run as a daemon-runner
//! child so the VM outlives the invoking CLI process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SystemConfig;
use crate::daemon::{self, DaemonRunner, DaemonSpec, Probe};
use crate::error::CfdevError;

use super::{Driver, VmConfig};

pub const VM_LABEL: &str = "cfdev.kvm";
const QEMU: &str = "qemu-system-x86_64";
const TAP_DEVICE: &str = "cfdevtap0";

pub struct KvmDriver {
    state_dir: PathBuf,
    helper: DaemonSpec,
    daemons: Arc<dyn DaemonRunner>,
}

impl KvmDriver {
    pub fn new(sys_config: &SystemConfig, daemons: Arc<dyn DaemonRunner>) -> Self {
        Self {
            state_dir: sys_config.backend_dir("kvm"),
            helper: daemon::net_helper_spec(sys_config),
            daemons,
        }
    }

    fn vm_spec(&self, vm: &VmConfig) -> DaemonSpec {
        let console = self.state_dir.join("console.log");
        let args = vec![
            "-machine".into(),
            "q35,accel=kvm".into(),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            vm.cpus.to_string(),
            "-m".into(),
            format!("{}M", vm.memory_mb),
            "-cdrom".into(),
            vm.image.display().to_string(),
            "-boot".into(),
            "d".into(),
            "-netdev".into(),
            format!("tap,id=net0,ifname={TAP_DEVICE},script=no,downscript=no"),
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
            "-display".into(),
            "none".into(),
            "-serial".into(),
            format!("file:{}", console.display()),
        ];
        DaemonSpec {
            label: VM_LABEL.into(),
            program: PathBuf::from(QEMU),
            args,
            log_path: Some(self.state_dir.join("qemu.log")),
            probe: Probe::Process,
            startup_timeout: Duration::from_secs(30),
        }
    }

    fn start_failed(&self, e: CfdevError) -> CfdevError {
        match e {
            e @ CfdevError::HelperStartupTimeout { .. } => e,
            other => CfdevError::DriverStartFailed {
                driver: self.name().into(),
                message: other.detail(),
            },
        }
    }
}

#[async_trait]
impl Driver for KvmDriver {
    fn name(&self) -> &'static str {
        "kvm"
    }

    async fn setup_networking(&self) -> Result<(), CfdevError> {
        self.daemons.ensure_running(&self.helper).await
    }

    async fn start(&self, vm: &VmConfig) -> Result<(), CfdevError> {
        if self.is_running().await? {
            tracing::info!("kvm VM already running");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| CfdevError::io(format!("creating {}", self.state_dir.display()), e))?;
        self.daemons
            .ensure_running(&self.vm_spec(vm))
            .await
            .map_err(|e| self.start_failed(e))
    }

    async fn stop(&self) -> Result<(), CfdevError> {
        if !self.is_running().await? {
            return Ok(());
        }
        self.daemons
            .stop(VM_LABEL)
            .await
            .map_err(|e| CfdevError::DriverStopFailed {
                driver: self.name().into(),
                message: e.detail(),
            })
    }

    async fn is_running(&self) -> Result<bool, CfdevError> {
        Ok(self.daemons.is_running(VM_LABEL).await)
    }

    async fn destroy(&self) -> Result<(), CfdevError> {
        self.stop().await?;
        match tokio::fs::remove_dir_all(&self.state_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CfdevError::io(
                format!("removing {}", self.state_dir.display()),
                e,
            )),
        }
    }
}
