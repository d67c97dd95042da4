//! macOS backend: a linuxkit VM under hyperkit, networked through vpnkit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SystemConfig;
use crate::daemon::{self, DaemonRunner, DaemonSpec, Probe};
use crate::error::CfdevError;

use super::{Driver, VmConfig};

pub const VM_LABEL: &str = "org.cloudfoundry.cfdev.linuxkit";
pub const VPNKIT_LABEL: &str = "org.cloudfoundry.cfdev.vpnkit";

/// UEFI firmware asset expected next to the boot image in the cache.
pub const FIRMWARE_ASSET: &str = "UEFI.fd";
const VM_UUID: &str = "c9a6d2b0-8f1e-4d6b-9a2c-cfde7c0ffee0";

pub struct HyperkitDriver {
    state_dir: PathBuf,
    helper: DaemonSpec,
    daemons: Arc<dyn DaemonRunner>,
}

impl HyperkitDriver {
    pub fn new(sys_config: &SystemConfig, daemons: Arc<dyn DaemonRunner>) -> Self {
        Self {
            state_dir: sys_config.backend_dir("hyperkit"),
            helper: daemon::net_helper_spec(sys_config),
            daemons,
        }
    }

    fn vpnkit_socket(&self) -> PathBuf {
        self.state_dir.join("vpnkit_eth.sock")
    }

    fn vpnkit_spec(&self) -> DaemonSpec {
        let socket = self.vpnkit_socket();
        DaemonSpec {
            label: VPNKIT_LABEL.into(),
            program: PathBuf::from("vpnkit"),
            args: vec![
                "--ethernet".into(),
                socket.display().to_string(),
                "--port".into(),
                self.state_dir.join("vpnkit_port.sock").display().to_string(),
            ],
            log_path: Some(self.state_dir.join("vpnkit.log")),
            probe: Probe::Socket(socket),
            startup_timeout: Duration::from_secs(20),
        }
    }

    fn vm_spec(&self, vm: &VmConfig, firmware: PathBuf) -> DaemonSpec {
        let state = self.state_dir.display();
        let args = vec![
            "-A".into(),
            "-u".into(),
            "-c".into(),
            vm.cpus.to_string(),
            "-m".into(),
            format!("{}M", vm.memory_mb),
            "-s".into(),
            "0:0,hostbridge".into(),
            "-s".into(),
            "31,lpc".into(),
            "-s".into(),
            format!("1:0,virtio-vpnkit,path={}", self.vpnkit_socket().display()),
            "-s".into(),
            format!("2:0,ahci-cd,{}", vm.image.display()),
            "-U".into(),
            VM_UUID.into(),
            "-l".into(),
            format!("com1,autopty={state}/tty,log={state}/console-ring"),
            "-f".into(),
            format!("bootrom,{}", firmware.display()),
        ];
        DaemonSpec {
            label: VM_LABEL.into(),
            program: PathBuf::from("hyperkit"),
            args,
            log_path: Some(self.state_dir.join("hyperkit.log")),
            probe: Probe::Process,
            startup_timeout: Duration::from_secs(30),
        }
    }

    fn stop_error(&self, e: CfdevError) -> CfdevError {
        CfdevError::DriverStopFailed {
            driver: self.name().into(),
            message: e.detail(),
        }
    }

    fn start_error(&self, message: impl Into<String>) -> CfdevError {
        CfdevError::DriverStartFailed {
            driver: self.name().into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Driver for HyperkitDriver {
    fn name(&self) -> &'static str {
        "hyperkit"
    }

    async fn setup_networking(&self) -> Result<(), CfdevError> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| CfdevError::io(format!("creating {}", self.state_dir.display()), e))?;
        self.daemons.ensure_running(&self.helper).await?;
        self.daemons.ensure_running(&self.vpnkit_spec()).await
    }

    async fn start(&self, vm: &VmConfig) -> Result<(), CfdevError> {
        if self.is_running().await? {
            tracing::info!("hyperkit VM already running");
            return Ok(());
        }
        let firmware = vm.assets_dir.join(FIRMWARE_ASSET);
        if !firmware.exists() {
            return Err(self.start_error(format!(
                "firmware {} is missing; add {FIRMWARE_ASSET} to [[assets]]",
                firmware.display()
            )));
        }
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| CfdevError::io(format!("creating {}", self.state_dir.display()), e))?;

        match self.daemons.ensure_running(&self.vm_spec(vm, firmware)).await {
            Ok(()) => Ok(()),
            Err(e @ CfdevError::HelperStartupTimeout { .. }) => Err(e),
            Err(e) => Err(self.start_error(e.detail())),
        }
    }

    async fn teardown_networking(&self) -> Result<(), CfdevError> {
        self.daemons
            .stop(VPNKIT_LABEL)
            .await
            .map_err(|e| self.stop_error(e))
    }

    async fn stop(&self) -> Result<(), CfdevError> {
        if self.is_running().await? {
            self.daemons
                .stop(VM_LABEL)
                .await
                .map_err(|e| self.stop_error(e))?;
        }
        self.teardown_networking().await
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
