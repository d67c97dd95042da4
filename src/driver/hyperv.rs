//! Windows backend: a Generation 2 Hyper-V VM on an internal switch,
//! driven entirely through PowerShell cmdlets.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SystemConfig;
use crate::error::CfdevError;

use super::{Driver, VmConfig};

pub const VM_NAME: &str = "cfdev";
pub const SWITCH_NAME: &str = "cfdev";

const GUEST_SERVICES_KEY: &str = r"HKLM:\SOFTWARE\Microsoft\Windows NT\CurrentVersion\Virtualization\GuestCommunicationServices";

/// Fixed network-topology identifiers. The guest image is built against
/// these values, so they are not user-configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyIds {
    pub mac_address: &'static str,
    /// Hyper-V socket service IDs for the guest agent, the forwarder and
    /// the DNS proxy, in that order.
    pub service_ids: [&'static str; 3],
}

impl TopologyIds {
    pub const DEFAULT: TopologyIds = TopologyIds {
        mac_address: "00155D0A0002",
        service_ids: [
            "7207f451-2ca3-4b88-8d01-820a21d78293",
            "cc2a519a-fb40-4e45-a9f1-c7f04c5ad7fa",
            "e3ae8f06-8c25-47fb-b6ed-c20702bcef5e",
        ],
    };
}

const SERVICE_NAMES: [&str; 3] = ["CF Dev Agent", "CF Dev Forwarder", "CF Dev DNS"];

#[async_trait]
pub trait PowerShell: Send + Sync {
    /// Run `script` and return its trimmed stdout.
    async fn run(&self, script: &str) -> Result<String, CfdevError>;
}

pub struct SystemPowerShell;

#[async_trait]
impl PowerShell for SystemPowerShell {
    async fn run(&self, script: &str) -> Result<String, CfdevError> {
        tracing::debug!(script, "powershell");
        let output = tokio::process::Command::new("powershell.exe")
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
            .await
            .map_err(|e| CfdevError::io("running powershell.exe", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CfdevError::io(
                "running powershell.exe",
                std::io::Error::other(format!("{}: {}", output.status, stderr.trim())),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Single-quote a value for a PowerShell literal string.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub struct HyperVDriver {
    state_dir: PathBuf,
    shell: Arc<dyn PowerShell>,
    ids: TopologyIds,
}

impl HyperVDriver {
    pub fn new(sys_config: &SystemConfig, shell: Arc<dyn PowerShell>, ids: TopologyIds) -> Self {
        Self {
            state_dir: sys_config.backend_dir("hyperv"),
            shell,
            ids,
        }
    }

    async fn exists(&self) -> Result<bool, CfdevError> {
        let out = self
            .shell
            .run(&format!(
                "@(Get-VM -Name {} -ErrorAction SilentlyContinue).Count",
                ps_quote(VM_NAME)
            ))
            .await?;
        Ok(out != "0" && !out.is_empty())
    }

    /// Applied on every boot so overrides reach a VM created earlier.
    fn sizing_script(vm: &VmConfig) -> String {
        let name = ps_quote(VM_NAME);
        format!(
            "Set-VMProcessor -VMName {name} -Count {}; \
             Set-VMMemory -VMName {name} -StartupBytes {}MB -DynamicMemoryEnabled $false",
            vm.cpus, vm.memory_mb
        )
    }

    fn create_script(&self, vm: &VmConfig) -> String {
        let name = ps_quote(VM_NAME);
        [
            format!(
                "New-VM -Name {name} -Generation 2 -NoVHD -Path {} | Out-Null",
                ps_quote(&self.state_dir.display().to_string())
            ),
            format!(
                "Add-VMDvdDrive -VMName {name} -Path {}",
                ps_quote(&vm.image.display().to_string())
            ),
            format!(
                "Set-VMFirmware -VMName {name} -EnableSecureBoot Off -FirstBootDevice (Get-VMDvdDrive -VMName {name})"
            ),
            format!(
                "Get-VMNetworkAdapter -VMName {name} | Connect-VMNetworkAdapter -SwitchName {}",
                ps_quote(SWITCH_NAME)
            ),
            format!(
                "Set-VMNetworkAdapter -VMName {name} -StaticMacAddress {}",
                ps_quote(self.ids.mac_address)
            ),
        ]
        .join("; ")
    }

    fn start_error(e: CfdevError) -> CfdevError {
        CfdevError::DriverStartFailed {
            driver: "hyperv".into(),
            message: e.detail(),
        }
    }

    fn stop_error(e: CfdevError) -> CfdevError {
        CfdevError::DriverStopFailed {
            driver: "hyperv".into(),
            message: e.detail(),
        }
    }
}

#[async_trait]
impl Driver for HyperVDriver {
    fn name(&self) -> &'static str {
        "hyperv"
    }

    async fn setup_networking(&self) -> Result<(), CfdevError> {
        let switch = ps_quote(SWITCH_NAME);
        self.shell
            .run(&format!(
                "if (-not (Get-VMSwitch -Name {switch} -ErrorAction SilentlyContinue)) \
                 {{ New-VMSwitch -Name {switch} -SwitchType Internal | Out-Null }}"
            ))
            .await
            .map_err(Self::start_error)?;

        for (id, label) in self.ids.service_ids.iter().zip(SERVICE_NAMES) {
            let path = ps_quote(&format!("{GUEST_SERVICES_KEY}\\{id}"));
            self.shell
                .run(&format!(
                    "if (-not (Test-Path {path})) {{ New-Item -Path {path} -Force | Out-Null; \
                     Set-ItemProperty -Path {path} -Name ElementName -Value {} }}",
                    ps_quote(label)
                ))
                .await
                .map_err(Self::start_error)?;
        }
        Ok(())
    }

    async fn start(&self, vm: &VmConfig) -> Result<(), CfdevError> {
        if self.is_running().await? {
            tracing::info!("Hyper-V VM already running");
            return Ok(());
        }
        if !self.exists().await.map_err(Self::start_error)? {
            tokio::fs::create_dir_all(&self.state_dir)
                .await
                .map_err(|e| CfdevError::io(format!("creating {}", self.state_dir.display()), e))?;
            tracing::info!("creating Hyper-V VM");
            self.shell
                .run(&self.create_script(vm))
                .await
                .map_err(Self::start_error)?;
        }
        tracing::debug!(cpus = vm.cpus, memory_mb = vm.memory_mb, "sizing Hyper-V VM");
        self.shell
            .run(&Self::sizing_script(vm))
            .await
            .map_err(Self::start_error)?;
        self.shell
            .run(&format!("Start-VM -Name {}", ps_quote(VM_NAME)))
            .await
            .map(|_| ())
            .map_err(Self::start_error)
    }

    async fn stop(&self) -> Result<(), CfdevError> {
        if !self.is_running().await? {
            return Ok(());
        }
        self.shell
            .run(&format!("Stop-VM -Name {} -TurnOff", ps_quote(VM_NAME)))
            .await
            .map(|_| ())
            .map_err(Self::stop_error)
    }

    async fn is_running(&self) -> Result<bool, CfdevError> {
        let state = self
            .shell
            .run(&format!(
                "(Get-VM -Name {} -ErrorAction SilentlyContinue).State",
                ps_quote(VM_NAME)
            ))
            .await?;
        Ok(state == "Running")
    }

    async fn destroy(&self) -> Result<(), CfdevError> {
        self.stop().await?;
        if self.exists().await.map_err(Self::stop_error)? {
            self.shell
                .run(&format!("Remove-VM -Name {} -Force", ps_quote(VM_NAME)))
                .await
                .map_err(Self::stop_error)?;
        }
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
