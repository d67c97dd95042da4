//! Lifecycle orchestration.
//!
//! Each command (start, stop, destroy, provision) is a [`Flow`]: pure
//! transition rules mapping `(LifecycleState, Event) -> (LifecycleState,
//! Vec<Effect>)`. The event loop runs the effects against the driver,
//! cache and provisioner and feeds their completion events back in.
//!
//! Nothing is remembered between invocations. Every flow begins by asking
//! the driver whether the VM is running and resumes from there.

pub mod event_loop;
pub mod provision;
pub mod start;
pub mod stop;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::analytics::{AnalyticsClient, CONSENT_MESSAGE};
use crate::cache::{Cache, CacheItem, Fetcher};
use crate::config::SystemConfig;
use crate::daemon::{self, DaemonRunner, DaemonSpec};
use crate::driver::{Driver, VmConfig};
use crate::error::{CfdevError, Stage};
use crate::observer::{Observer, ObserverProgress};
use crate::provision::{Deployment, Provisioner};

// ── States ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    FetchingResources,
    StartingVm,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::FetchingResources => "fetching_resources",
            LifecycleState::StartingVm => "starting_vm",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    /// Human wording for progress output.
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::FetchingResources => "fetching resources",
            LifecycleState::StartingVm => "starting VM",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Running | LifecycleState::Stopped | LifecycleState::Failed
        )
    }

    /// Stage the state belongs to, for error reporting.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            LifecycleState::FetchingResources => Some(Stage::Fetch),
            LifecycleState::StartingVm => Some(Stage::Start),
            LifecycleState::Provisioning => Some(Stage::Provision),
            LifecycleState::Stopping => Some(Stage::Stop),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Worker completions fed back into a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    FlowStarted,
    VmProbed { running: bool },
    AssetsReady,
    VmStarted,
    Provisioned,
    VmStopped,
    DaemonsStopped,
    /// A worker failed; the error itself is held by the event loop.
    Failed(Stage),
}

// ── Effects ─────────────────────────────────────────────────────────

/// Work dispatched by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Ask the driver whether the VM is running.
    ProbeVm,
    /// Like `ProbeVm`, but a stopped VM is an error.
    RequireRunningVm,
    /// Ensure every catalog asset is cached and verified.
    FetchAssets,
    /// Set up networking and boot the VM.
    StartVm,
    /// Wait for the controller and apply the deployment.
    Provision,
    StopVm,
    DestroyVm,
    /// Stop the helper daemons.
    StopDaemons,
}

impl Effect {
    fn stage(&self, flow_stage: Stage) -> Stage {
        match self {
            Effect::ProbeVm | Effect::RequireRunningVm => flow_stage,
            Effect::FetchAssets => Stage::Fetch,
            Effect::StartVm => Stage::Start,
            Effect::Provision => Stage::Provision,
            Effect::StopVm | Effect::DestroyVm | Effect::StopDaemons => Stage::Stop,
        }
    }
}

// ── Flow trait ──────────────────────────────────────────────────────

pub trait Flow: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stage blamed for failures outside a specific step.
    fn stage(&self) -> Stage;

    /// Pure transition. Unknown events leave the state unchanged.
    fn transition(&self, state: LifecycleState, event: &Event) -> (LifecycleState, Vec<Effect>);
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// External collaborators a [`Lifecycle`] drives.
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub driver: Box<dyn Driver>,
    pub provisioner: Box<dyn Provisioner>,
    pub daemons: Arc<dyn DaemonRunner>,
    pub analytics: Arc<dyn AnalyticsClient>,
    pub observer: Arc<dyn Observer>,
    /// Started on `start` when analytics is enabled.
    pub analytics_daemon: Option<DaemonSpec>,
}

/// Per-invocation overrides for `start`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub provision: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            cpus: None,
            memory_mb: None,
            provision: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub paths: Vec<PathBuf>,
    pub pruned: Vec<String>,
    pub bytes: u64,
}

/// The command bodies. Owns the process's single driver.
pub struct Lifecycle {
    sys_config: SystemConfig,
    cache: Cache,
    assets: Vec<CacheItem>,
    driver: Box<dyn Driver>,
    provisioner: Box<dyn Provisioner>,
    daemons: Arc<dyn DaemonRunner>,
    analytics: Arc<dyn AnalyticsClient>,
    observer: Arc<dyn Observer>,
    analytics_daemon: Option<DaemonSpec>,
    current: Mutex<Option<(LifecycleState, Stage)>>,
}

impl Lifecycle {
    pub fn new(sys_config: &SystemConfig, parts: Collaborators) -> Self {
        let cache = Cache::new(
            sys_config.cache_dir(),
            parts.fetcher,
            sys_config.config.cache.retry_attempts,
            sys_config.retry_wait(),
        );
        Self {
            sys_config: sys_config.clone(),
            cache,
            assets: sys_config.catalog(),
            driver: parts.driver,
            provisioner: parts.provisioner,
            daemons: parts.daemons,
            analytics: parts.analytics,
            observer: parts.observer,
            analytics_daemon: parts.analytics_daemon,
            current: Mutex::new(None),
        }
    }

    /// Fetch, boot and provision, resuming wherever a previous run stopped.
    pub async fn start(&self, opts: &StartOptions) -> Result<LifecycleState, CfdevError> {
        if let Err(e) = self.analytics.prompt_opt_in_if_needed(CONSENT_MESSAGE) {
            tracing::warn!(error = %e, "analytics consent prompt failed");
        }
        self.ensure_analytics_daemon().await;

        let vm = self.vm_config(opts)?;
        let flow = start::StartFlow {
            provision: opts.provision,
        };
        event_loop::run_flow(self, &flow, Some(&vm)).await
    }

    pub async fn stop(&self) -> Result<LifecycleState, CfdevError> {
        event_loop::run_flow(self, &stop::StopFlow { destroy: false }, None).await
    }

    /// Stop and remove all backend state for the VM.
    pub async fn destroy(&self) -> Result<LifecycleState, CfdevError> {
        event_loop::run_flow(self, &stop::StopFlow { destroy: true }, None).await
    }

    /// Re-run provisioning against an already running VM.
    pub async fn provision(&self) -> Result<LifecycleState, CfdevError> {
        event_loop::run_flow(self, &provision::ProvisionFlow, None).await
    }

    /// Bring the cache in line with the catalog without starting anything.
    pub async fn download(&self) -> Result<DownloadReport, CfdevError> {
        let progress = ObserverProgress(self.observer.as_ref());
        let paths = self.cache.sync(&self.assets, &progress).await?;
        let pruned = self.cache.prune(&self.assets).await?;
        let mut bytes = 0;
        for path in &paths {
            match tokio::fs::metadata(path).await {
                Ok(meta) => bytes += meta.len(),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "size left out of total")
                }
            }
        }
        Ok(DownloadReport {
            paths,
            pruned,
            bytes,
        })
    }

    /// Stage of the step currently running, for reporting an interrupt.
    pub fn current_stage(&self) -> Stage {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match *current {
            Some((state, flow_stage)) => state.stage().unwrap_or(flow_stage),
            None => Stage::Start,
        }
    }

    fn set_current(&self, state: LifecycleState, flow_stage: Stage) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some((state, flow_stage));
    }

    fn vm_config(&self, opts: &StartOptions) -> Result<VmConfig, CfdevError> {
        let mut vm = VmConfig::from_system(&self.sys_config)?;
        if let Some(cpus) = opts.cpus {
            if cpus < 1 {
                return Err(CfdevError::Validation {
                    message: "cpus must be at least 1".into(),
                });
            }
            vm.cpus = cpus;
        }
        if let Some(memory_mb) = opts.memory_mb {
            if memory_mb < 1024 {
                return Err(CfdevError::Validation {
                    message: "memory must be at least 1024 MiB".into(),
                });
            }
            vm.memory_mb = memory_mb;
        }
        Ok(vm)
    }

    async fn ensure_analytics_daemon(&self) {
        let Some(ref spec) = self.analytics_daemon else {
            return;
        };
        if !self.analytics.enabled() {
            return;
        }
        if let Err(e) = self.daemons.ensure_running(spec).await {
            tracing::warn!(error = %e, "analytics daemon did not start");
        }
    }

    fn deployment(&self) -> Result<Option<Deployment>, CfdevError> {
        let Some(manifest) = self.sys_config.deployment_manifest()? else {
            return Ok(None);
        };
        let name = self
            .sys_config
            .config
            .provision
            .deployment
            .as_deref()
            .and_then(|p| std::path::Path::new(p).file_stem())
            .and_then(|s| s.to_str())
            .unwrap_or("cf")
            .to_string();
        Ok(Some(Deployment { name, manifest }))
    }

    fn helper_labels(&self) -> Vec<&'static str> {
        vec![daemon::ANALYTICS_LABEL, daemon::NET_HELPER_LABEL]
    }

    /// Record one transition. Advisory: failures are only logged.
    async fn record_transition(
        &self,
        flow: &'static str,
        from: LifecycleState,
        to: LifecycleState,
        elapsed: Duration,
    ) {
        let properties = BTreeMap::from([
            ("command".to_string(), flow.to_string()),
            ("state".to_string(), from.as_str().to_string()),
            ("next".to_string(), to.as_str().to_string()),
            ("duration_ms".to_string(), elapsed.as_millis().to_string()),
        ]);
        if let Err(e) = self.analytics.event("state transition", properties).await {
            tracing::debug!(error = %e, "analytics event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::checksum::sha256_bytes;
    use crate::config::AssetConfig;
    use crate::testing::{
        FakeAnalytics, FakeDaemonRunner, FakeDriver, FakeFetcher, FakeProvisioner,
        RecordingObserver,
    };

    const IMAGE: &[u8] = b"bootable image";

    struct Harness {
        _home: tempfile::TempDir,
        sys: SystemConfig,
        fetcher: Arc<FakeFetcher>,
        driver: FakeDriver,
        provisioner: FakeProvisioner,
        daemons: Arc<FakeDaemonRunner>,
        analytics: Arc<FakeAnalytics>,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        fn new() -> Self {
            let home = tempfile::tempdir().unwrap();
            let mut sys = crate::config::tests::test_system_config(home.path());
            sys.config.assets = vec![AssetConfig {
                name: "cfdev-efi.iso".into(),
                url: "https://example.com/cfdev-efi.iso".into(),
                sha256: sha256_bytes(IMAGE),
                size: Some(IMAGE.len() as u64),
            }];
            sys.config.cache.retry_wait_ms = 0;
            std::fs::write(home.path().join("cf.yml"), b"name: cf\n").unwrap();
            sys.config.provision.deployment = Some("cf.yml".into());
            Self {
                _home: home,
                sys,
                fetcher: Arc::new(FakeFetcher::serving(IMAGE)),
                driver: FakeDriver::default(),
                provisioner: FakeProvisioner::default(),
                daemons: Arc::new(FakeDaemonRunner::default()),
                analytics: Arc::new(FakeAnalytics::consenting(true)),
                observer: Arc::new(RecordingObserver::default()),
            }
        }

        fn lifecycle(&self) -> Lifecycle {
            Lifecycle::new(
                &self.sys,
                Collaborators {
                    fetcher: self.fetcher.clone(),
                    driver: Box::new(self.driver.clone()),
                    provisioner: Box::new(self.provisioner.clone()),
                    daemons: self.daemons.clone(),
                    analytics: self.analytics.clone(),
                    observer: self.observer.clone(),
                    analytics_daemon: None,
                },
            )
        }
    }

    use LifecycleState::*;

    #[tokio::test]
    async fn fresh_start_runs_every_stage_once() {
        let h = Harness::new();

        let state = h.lifecycle().start(&StartOptions::default()).await.unwrap();

        assert_eq!(state, Running);
        assert_eq!(
            h.observer.states(),
            vec![FetchingResources, StartingVm, Provisioning, Running]
        );
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.driver.start_calls(), 1);
        assert_eq!(h.driver.networking_calls(), 1);
        assert_eq!(h.provisioner.deploy_calls(), 1);
    }

    #[tokio::test]
    async fn cached_asset_skips_network() {
        let h = Harness::new();
        let cache_dir = h.sys.cache_dir();
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("cfdev-efi.iso"), IMAGE).unwrap();

        h.lifecycle().start(&StartOptions::default()).await.unwrap();

        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(
            h.observer.states(),
            vec![FetchingResources, StartingVm, Provisioning, Running]
        );
        assert_eq!(h.driver.start_calls(), 1);
    }

    #[tokio::test]
    async fn provisioning_failure_resumes_without_restarting() {
        let h = Harness::new();
        h.provisioner.fail_next(1);

        let err = h.lifecycle().start(&StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, CfdevError::ProvisioningFailed { .. }));
        assert_eq!(err.stage(), Some(Stage::Provision));
        assert!(h.driver.running());
        assert_eq!(h.observer.states().last(), Some(&Failed));

        h.observer.clear();
        let state = h.lifecycle().start(&StartOptions::default()).await.unwrap();

        assert_eq!(state, Running);
        assert_eq!(h.observer.states(), vec![Provisioning, Running]);
        assert_eq!(h.driver.start_calls(), 1);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.provisioner.deploy_calls(), 2);
    }

    #[tokio::test]
    async fn running_vm_is_not_started_again() {
        let h = Harness::new();
        h.driver.set_running(true);

        h.lifecycle().start(&StartOptions::default()).await.unwrap();

        assert_eq!(h.driver.start_calls(), 0);
        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(h.provisioner.deploy_calls(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_never_touches_the_driver() {
        let mut h = Harness::new();
        h.fetcher = Arc::new(FakeFetcher::serving(b"corrupted"));

        let err = h.lifecycle().start(&StartOptions::default()).await.unwrap_err();

        assert!(matches!(err, CfdevError::ChecksumMismatch { .. }));
        assert_eq!(err.stage(), Some(Stage::Fetch));
        assert_eq!(h.driver.start_calls(), 0);
        assert_eq!(h.observer.states(), vec![FetchingResources, Failed]);
    }

    #[tokio::test]
    async fn start_failure_skips_provisioning() {
        let h = Harness::new();
        h.driver.fail_start("hypervisor unavailable");

        let err = h.lifecycle().start(&StartOptions::default()).await.unwrap_err();

        assert!(matches!(err, CfdevError::DriverStartFailed { .. }));
        assert_eq!(h.provisioner.deploy_calls(), 0);
        assert_eq!(h.provisioner.wait_calls(), 0);
    }

    #[tokio::test]
    async fn no_provision_stops_at_running() {
        let h = Harness::new();
        let opts = StartOptions {
            provision: false,
            ..StartOptions::default()
        };

        h.lifecycle().start(&opts).await.unwrap();

        assert_eq!(h.observer.states(), vec![FetchingResources, StartingVm, Running]);
        assert_eq!(h.provisioner.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn overrides_reach_the_driver() {
        let h = Harness::new();
        let opts = StartOptions {
            cpus: Some(2),
            memory_mb: Some(4096),
            provision: false,
        };

        h.lifecycle().start(&opts).await.unwrap();

        let vm = h.driver.last_vm().unwrap();
        assert_eq!(vm.cpus, 2);
        assert_eq!(vm.memory_mb, 4096);
    }

    #[tokio::test]
    async fn undersized_memory_override_is_rejected() {
        let h = Harness::new();
        let opts = StartOptions {
            memory_mb: Some(512),
            ..StartOptions::default()
        };
        let err = h.lifecycle().start(&opts).await.unwrap_err();
        assert!(matches!(err, CfdevError::Validation { .. }));
        assert!(h.observer.states().is_empty());
    }

    #[tokio::test]
    async fn stop_on_stopped_vm_is_a_no_op() {
        let h = Harness::new();

        let state = h.lifecycle().stop().await.unwrap();

        assert_eq!(state, Stopped);
        assert_eq!(h.driver.stop_calls(), 0);
        assert_eq!(h.driver.destroy_calls(), 0);
        assert_eq!(
            h.daemons.stopped(),
            vec![daemon::ANALYTICS_LABEL.to_string(), daemon::NET_HELPER_LABEL.to_string()]
        );
        assert_eq!(h.observer.states(), vec![Stopping, Stopped]);
    }

    #[tokio::test]
    async fn stop_halts_vm_then_daemons() {
        let h = Harness::new();
        h.driver.set_running(true);

        h.lifecycle().stop().await.unwrap();

        assert_eq!(h.driver.stop_calls(), 1);
        assert!(!h.driver.running());
        assert_eq!(h.daemons.stopped().len(), 2);
    }

    #[tokio::test]
    async fn stop_after_failed_start_succeeds() {
        let h = Harness::new();
        h.driver.fail_start("boom");
        h.lifecycle().start(&StartOptions::default()).await.unwrap_err();

        assert_eq!(h.lifecycle().stop().await.unwrap(), Stopped);
    }

    #[tokio::test]
    async fn stop_after_failed_hyperkit_boot_releases_vpnkit() {
        use crate::driver::hyperkit::{self, HyperkitDriver};

        let h = Harness::new();
        let lc = Lifecycle::new(
            &h.sys,
            Collaborators {
                fetcher: h.fetcher.clone(),
                driver: Box::new(HyperkitDriver::new(&h.sys, h.daemons.clone())),
                provisioner: Box::new(h.provisioner.clone()),
                daemons: h.daemons.clone(),
                analytics: h.analytics.clone(),
                observer: h.observer.clone(),
                analytics_daemon: None,
            },
        );

        // No UEFI firmware in the cache, so boot fails after networking is up.
        let err = lc.start(&StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, CfdevError::DriverStartFailed { .. }));
        assert!(h.daemons.is_running(hyperkit::VPNKIT_LABEL).await);

        assert_eq!(lc.stop().await.unwrap(), Stopped);

        assert!(!h.daemons.is_running(hyperkit::VPNKIT_LABEL).await);
        assert!(!h.daemons.is_running(daemon::NET_HELPER_LABEL).await);
        assert_eq!(
            h.daemons.stopped(),
            vec![
                hyperkit::VPNKIT_LABEL.to_string(),
                daemon::ANALYTICS_LABEL.to_string(),
                daemon::NET_HELPER_LABEL.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn driver_stop_failure_is_reported() {
        let h = Harness::new();
        h.driver.set_running(true);
        h.driver.fail_stop("VM is wedged");

        let err = h.lifecycle().stop().await.unwrap_err();
        assert!(matches!(err, CfdevError::DriverStopFailed { .. }));
        assert_eq!(err.stage(), Some(Stage::Stop));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let h = Harness::new();
        h.driver.set_running(true);

        h.lifecycle().destroy().await.unwrap();
        h.lifecycle().destroy().await.unwrap();

        assert_eq!(h.driver.destroy_calls(), 2);
        assert_eq!(h.driver.stop_calls(), 0);
        assert!(!h.driver.running());
    }

    #[tokio::test]
    async fn provision_requires_running_vm() {
        let h = Harness::new();

        let err = h.lifecycle().provision().await.unwrap_err();

        assert!(matches!(err, CfdevError::VmNotRunning));
        assert_eq!(h.provisioner.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn provision_reapplies_deployment() {
        let h = Harness::new();
        h.driver.set_running(true);

        let state = h.lifecycle().provision().await.unwrap();

        assert_eq!(state, Running);
        let deployment = h.provisioner.last_deployment().unwrap();
        assert_eq!(deployment.name, "cf");
        assert_eq!(deployment.manifest, b"name: cf\n");
    }

    #[tokio::test]
    async fn without_deployment_provisioning_only_waits() {
        let mut h = Harness::new();
        h.sys.config.provision.deployment = None;

        assert_eq!(h.lifecycle().start(&StartOptions::default()).await.unwrap(), Running);

        assert_eq!(h.provisioner.wait_calls(), 1);
        assert_eq!(h.provisioner.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_platform_fails_start_and_stop() {
        let h = Harness::new();
        let lc = Lifecycle::new(
            &h.sys,
            Collaborators {
                fetcher: h.fetcher.clone(),
                driver: crate::driver::select_driver(None, &h.sys, h.daemons.clone()),
                provisioner: Box::new(h.provisioner.clone()),
                daemons: h.daemons.clone(),
                analytics: h.analytics.clone(),
                observer: h.observer.clone(),
                analytics_daemon: None,
            },
        );

        let err = lc.start(&StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, CfdevError::UnsupportedPlatform { .. }));
        let err = lc.stop().await.unwrap_err();
        assert!(matches!(err, CfdevError::UnsupportedPlatform { .. }));
    }

    #[tokio::test]
    async fn every_transition_is_recorded() {
        let h = Harness::new();

        h.lifecycle().start(&StartOptions::default()).await.unwrap();

        let events = h.analytics.events();
        assert_eq!(events.len(), 4);
        let (name, props) = &events[1];
        assert_eq!(name, "state transition");
        assert_eq!(props["command"], "start");
        assert_eq!(props["state"], "fetching_resources");
        assert_eq!(props["next"], "starting_vm");
        assert!(props.contains_key("duration_ms"));
    }

    #[tokio::test]
    async fn declined_consent_records_nothing_across_a_full_cycle() {
        let mut h = Harness::new();
        h.analytics = Arc::new(FakeAnalytics::consenting(false));

        let lc = h.lifecycle();
        lc.start(&StartOptions::default()).await.unwrap();
        lc.provision().await.unwrap();
        lc.stop().await.unwrap();

        assert!(h.analytics.events().is_empty());
        assert_eq!(h.analytics.prompts(), 1);
    }

    #[tokio::test]
    async fn analytics_failure_does_not_change_outcomes() {
        let mut h = Harness::new();
        h.analytics = Arc::new(FakeAnalytics::failing());
        let lc = h.lifecycle();
        assert_eq!(lc.start(&StartOptions::default()).await.unwrap(), Running);
        assert_eq!(lc.provision().await.unwrap(), Running);
        assert_eq!(lc.stop().await.unwrap(), Stopped);

        let mut failing = Harness::new();
        failing.analytics = Arc::new(FakeAnalytics::failing());
        failing.provisioner.fail_next(1);
        let err = failing
            .lifecycle()
            .start(&StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CfdevError::ProvisioningFailed { .. }));
    }

    #[tokio::test]
    async fn enabled_analytics_starts_its_daemon() {
        let h = Harness::new();
        let mut lc = h.lifecycle();
        lc.analytics_daemon = Some(DaemonSpec {
            label: daemon::ANALYTICS_LABEL.into(),
            program: PathBuf::from("cfdev"),
            args: vec!["analyticsd".into()],
            log_path: None,
            probe: daemon::Probe::Process,
            startup_timeout: Duration::from_secs(1),
        });

        lc.start(&StartOptions::default()).await.unwrap();

        assert!(h.daemons.started().contains(&daemon::ANALYTICS_LABEL.to_string()));
    }

    #[tokio::test]
    async fn download_syncs_and_prunes() {
        let h = Harness::new();
        let cache_dir = h.sys.cache_dir();
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("stale.iso"), b"old").unwrap();

        let report = h.lifecycle().download().await.unwrap();

        assert_eq!(report.paths, vec![cache_dir.join("cfdev-efi.iso")]);
        assert_eq!(report.pruned, vec!["stale.iso".to_string()]);
        assert_eq!(report.bytes, IMAGE.len() as u64);
        assert_eq!(h.driver.start_calls(), 0);
    }
}
