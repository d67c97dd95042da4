//! In-memory stand-ins for the external collaborators, shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::analytics::daemon::EventUploader;
use crate::analytics::{AnalyticsClient, AnalyticsEvent, ConsentPrompt, EventSink};
use crate::cache::DownloadProgress;
use crate::cache::fetch::{FetchError, Fetched, Fetcher};
use crate::daemon::{DaemonRunner, DaemonSpec};
use crate::driver::hyperv::PowerShell;
use crate::driver::{Driver, VmConfig};
use crate::error::CfdevError;
use crate::lifecycle::LifecycleState;
use crate::observer::{Observer, Transition};
use crate::provision::{Deployment, Provisioner};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Fetcher ─────────────────────────────────────────────────────────

/// Behaviour of one fetch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Serve,
    /// Transient error before any bytes.
    Fail,
    /// Permanent error (404-like).
    NotFound,
    /// Server refuses the requested range.
    RangeRejected,
    /// Serve up to this absolute byte, then drop the connection.
    Truncate(usize),
}

pub struct FakeFetcher {
    content: Vec<u8>,
    script: Mutex<VecDeque<Scripted>>,
    chunk_size: usize,
    offsets: Mutex<Vec<u64>>,
}

impl FakeFetcher {
    /// Serves `content` on every call.
    pub fn serving(content: &[u8]) -> Self {
        Self::scripted(content, Vec::new())
    }

    /// Plays `script` in order, then serves normally.
    pub fn scripted(content: &[u8], script: Vec<Scripted>) -> Self {
        Self {
            content: content.to_vec(),
            script: Mutex::new(script.into()),
            chunk_size: 64 * 1024,
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.offsets).len()
    }

    /// Requested start offset of every call.
    pub fn offsets(&self) -> Vec<u64> {
        lock(&self.offsets).clone()
    }

    fn body(&self, from: usize, to: usize, cut: bool) -> Fetched {
        let mut chunks: Vec<Result<Vec<u8>, FetchError>> = self.content[from..to]
            .chunks(self.chunk_size)
            .map(|c| Ok(c.to_vec()))
            .collect();
        if cut {
            chunks.push(Err(FetchError::Transient("connection reset".into())));
        }
        Fetched {
            resumed: from > 0,
            total: Some(self.content.len() as u64),
            body: Box::pin(stream::iter(chunks)),
        }
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, _url: &str, offset: u64) -> Result<Fetched, FetchError> {
        lock(&self.offsets).push(offset);
        let step = lock(&self.script).pop_front().unwrap_or(Scripted::Serve);
        let len = self.content.len();
        // An offset past the end means the source ignores it and resends everything.
        let from = if offset as usize > len { 0 } else { offset as usize };
        match step {
            Scripted::Serve => Ok(self.body(from, len, false)),
            Scripted::Fail => Err(FetchError::Transient("503 service unavailable".into())),
            Scripted::NotFound => Err(FetchError::Permanent("404 not found".into())),
            Scripted::RangeRejected => Err(FetchError::RangeNotSatisfiable),
            Scripted::Truncate(at) => Ok(self.body(from, at.clamp(from, len), true)),
        }
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    ticks: Mutex<Vec<u64>>,
    completed: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn ticks(&self) -> Vec<u64> {
        lock(&self.ticks).clone()
    }

    pub fn completed(&self) -> Vec<String> {
        lock(&self.completed).clone()
    }
}

impl DownloadProgress for RecordingProgress {
    fn on_progress(&self, _name: &str, current: u64, _total: Option<u64>) {
        lock(&self.ticks).push(current);
    }

    fn on_complete(&self, name: &str) {
        lock(&self.completed).push(name.to_string());
    }
}

// ── Daemons ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDaemonRunner {
    running: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    specs: Mutex<HashMap<String, DaemonSpec>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeDaemonRunner {
    /// Labels actually launched, in order.
    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    /// Every stop request, running or not.
    pub fn stopped(&self) -> Vec<String> {
        lock(&self.stopped).clone()
    }

    pub fn last_spec(&self, label: &str) -> Option<DaemonSpec> {
        lock(&self.specs).get(label).cloned()
    }

    /// Make every launch of `label` fail.
    pub fn fail_label(&self, label: &str) {
        lock(&self.failing).insert(label.to_string());
    }
}

#[async_trait]
impl DaemonRunner for FakeDaemonRunner {
    async fn ensure_running(&self, spec: &DaemonSpec) -> Result<(), CfdevError> {
        if lock(&self.failing).contains(&spec.label) {
            return Err(CfdevError::io(
                format!("spawning {}", spec.program.display()),
                std::io::Error::other("exec format error"),
            ));
        }
        if !lock(&self.running).insert(spec.label.clone()) {
            return Ok(());
        }
        lock(&self.started).push(spec.label.clone());
        lock(&self.specs).insert(spec.label.clone(), spec.clone());
        Ok(())
    }

    async fn stop(&self, label: &str) -> Result<(), CfdevError> {
        lock(&self.running).remove(label);
        lock(&self.stopped).push(label.to_string());
        Ok(())
    }

    async fn is_running(&self, label: &str) -> bool {
        lock(&self.running).contains(label)
    }
}

// ── Driver ──────────────────────────────────────────────────────────

#[derive(Default)]
struct DriverState {
    running: bool,
    start_calls: usize,
    networking_calls: usize,
    stop_calls: usize,
    destroy_calls: usize,
    fail_start: Option<String>,
    fail_stop: Option<String>,
    last_vm: Option<VmConfig>,
}

/// Clones share state, so a test keeps a handle after boxing one.
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<DriverState>>,
}

impl FakeDriver {
    fn state(&self) -> MutexGuard<'_, DriverState> {
        lock(&self.state)
    }

    pub fn running(&self) -> bool {
        self.state().running
    }

    pub fn set_running(&self, running: bool) {
        self.state().running = running;
    }

    pub fn start_calls(&self) -> usize {
        self.state().start_calls
    }

    pub fn networking_calls(&self) -> usize {
        self.state().networking_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state().stop_calls
    }

    pub fn destroy_calls(&self) -> usize {
        self.state().destroy_calls
    }

    pub fn fail_start(&self, message: &str) {
        self.state().fail_start = Some(message.to_string());
    }

    pub fn fail_stop(&self, message: &str) {
        self.state().fail_stop = Some(message.to_string());
    }

    pub fn last_vm(&self) -> Option<VmConfig> {
        self.state().last_vm.clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn setup_networking(&self) -> Result<(), CfdevError> {
        self.state().networking_calls += 1;
        Ok(())
    }

    async fn start(&self, vm: &VmConfig) -> Result<(), CfdevError> {
        let mut state = self.state();
        state.start_calls += 1;
        if let Some(message) = state.fail_start.clone() {
            return Err(CfdevError::DriverStartFailed {
                driver: "fake".into(),
                message,
            });
        }
        state.running = true;
        state.last_vm = Some(vm.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), CfdevError> {
        let mut state = self.state();
        state.stop_calls += 1;
        if let Some(message) = state.fail_stop.clone() {
            return Err(CfdevError::DriverStopFailed {
                driver: "fake".into(),
                message,
            });
        }
        state.running = false;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, CfdevError> {
        Ok(self.state().running)
    }

    async fn destroy(&self) -> Result<(), CfdevError> {
        let mut state = self.state();
        state.destroy_calls += 1;
        if let Some(message) = state.fail_stop.clone() {
            return Err(CfdevError::DriverStopFailed {
                driver: "fake".into(),
                message,
            });
        }
        state.running = false;
        Ok(())
    }
}

// ── Provisioner ─────────────────────────────────────────────────────

#[derive(Default)]
struct ProvisionerState {
    failures_left: usize,
    wait_calls: usize,
    deploy_calls: usize,
    last_deployment: Option<Deployment>,
}

#[derive(Clone, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
}

impl FakeProvisioner {
    /// Reject the next `n` deployments.
    pub fn fail_next(&self, n: usize) {
        lock(&self.state).failures_left = n;
    }

    pub fn wait_calls(&self) -> usize {
        lock(&self.state).wait_calls
    }

    /// Includes rejected attempts.
    pub fn deploy_calls(&self) -> usize {
        lock(&self.state).deploy_calls
    }

    pub fn last_deployment(&self) -> Option<Deployment> {
        lock(&self.state).last_deployment.clone()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn wait_until_ready(&self, _address: &str, _timeout: Duration) -> Result<(), CfdevError> {
        lock(&self.state).wait_calls += 1;
        Ok(())
    }

    async fn deploy(&self, _address: &str, deployment: &Deployment) -> Result<(), CfdevError> {
        let mut state = lock(&self.state);
        state.deploy_calls += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(CfdevError::ProvisioningFailed {
                message: "deployment rejected by controller".into(),
            });
        }
        state.last_deployment = Some(deployment.clone());
        Ok(())
    }
}

// ── Analytics ───────────────────────────────────────────────────────

pub struct FakeAnalytics {
    answer: bool,
    enabled: Mutex<Option<bool>>,
    failing: bool,
    prompts: AtomicUsize,
    events: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl FakeAnalytics {
    /// Undecided until prompted; the prompt answers `answer`.
    pub fn consenting(answer: bool) -> Self {
        Self {
            answer,
            enabled: Mutex::new(None),
            failing: false,
            prompts: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Opted in, but every event fails to record.
    pub fn failing() -> Self {
        Self {
            answer: true,
            enabled: Mutex::new(Some(true)),
            failing: true,
            prompts: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<(String, BTreeMap<String, String>)> {
        lock(&self.events).clone()
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalyticsClient for FakeAnalytics {
    fn enabled(&self) -> bool {
        lock(&self.enabled).unwrap_or(false)
    }

    async fn event(
        &self,
        name: &str,
        properties: BTreeMap<String, String>,
    ) -> Result<(), CfdevError> {
        if self.failing {
            return Err(CfdevError::AnalyticsDelivery {
                message: "sink unavailable".into(),
            });
        }
        if self.enabled() {
            lock(&self.events).push((name.to_string(), properties));
        }
        Ok(())
    }

    fn prompt_opt_in_if_needed(&self, _message: &str) -> Result<(), CfdevError> {
        let mut enabled = lock(&self.enabled);
        if enabled.is_none() {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            *enabled = Some(self.answer);
        }
        Ok(())
    }
}

pub struct FakePrompt {
    answer: Option<bool>,
    asked: AtomicUsize,
}

impl FakePrompt {
    pub fn answering(answer: Option<bool>) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl ConsentPrompt for Arc<FakePrompt> {
    fn ask(&self, _message: &str) -> Result<Option<bool>, CfdevError> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

#[derive(Default)]
enum SinkMode {
    #[default]
    Record,
    Fail,
    Stall,
}

#[derive(Default)]
pub struct RecordingSink {
    mode: SinkMode,
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            mode: SinkMode::Fail,
            ..Self::default()
        }
    }

    /// Never completes an enqueue.
    pub fn stalled() -> Self {
        Self {
            mode: SinkMode::Stall,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn enqueue(&self, event: &AnalyticsEvent) -> Result<(), CfdevError> {
        match self.mode {
            SinkMode::Record => {
                lock(&self.events).push(event.clone());
                Ok(())
            }
            SinkMode::Fail => Err(CfdevError::io(
                "appending to spool",
                std::io::Error::other("disk full"),
            )),
            SinkMode::Stall => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingUploader {
    failing: bool,
    uploads: Mutex<Vec<(String, String)>>,
}

impl RecordingUploader {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// `(endpoint, event name)` of every successful upload.
    pub fn uploads(&self) -> Vec<(String, String)> {
        lock(&self.uploads).clone()
    }
}

#[async_trait]
impl EventUploader for RecordingUploader {
    async fn upload(&self, endpoint: &str, event: &AnalyticsEvent) -> Result<(), CfdevError> {
        if self.failing {
            return Err(CfdevError::AnalyticsDelivery {
                message: format!("{endpoint} returned 500 Internal Server Error"),
            });
        }
        lock(&self.uploads).push((endpoint.to_string(), event.name.clone()));
        Ok(())
    }
}

// ── Hyper-V ─────────────────────────────────────────────────────────

/// Answers scripts by substring match. First matching rule wins; anything
/// unmatched succeeds with empty output.
#[derive(Default)]
pub struct FakePowerShell {
    rules: Mutex<Vec<(String, Result<String, String>)>>,
    scripts: Mutex<Vec<String>>,
}

impl FakePowerShell {
    pub fn respond(&self, pattern: &str, output: &str) {
        lock(&self.rules).push((pattern.to_string(), Ok(output.to_string())));
    }

    pub fn fail(&self, pattern: &str, message: &str) {
        lock(&self.rules).push((pattern.to_string(), Err(message.to_string())));
    }

    pub fn scripts(&self) -> Vec<String> {
        lock(&self.scripts).clone()
    }
}

#[async_trait]
impl PowerShell for FakePowerShell {
    async fn run(&self, script: &str) -> Result<String, CfdevError> {
        lock(&self.scripts).push(script.to_string());
        let rules = lock(&self.rules);
        match rules.iter().find(|(pattern, _)| script.contains(pattern.as_str())) {
            Some((_, Ok(output))) => Ok(output.clone()),
            Some((_, Err(message))) => Err(CfdevError::io(
                "running powershell.exe",
                std::io::Error::other(message.clone()),
            )),
            None => Ok(String::new()),
        }
    }
}

// ── Observer ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingObserver {
    transitions: Mutex<Vec<Transition>>,
}

impl RecordingObserver {
    /// Destination state of every transition seen.
    pub fn states(&self) -> Vec<LifecycleState> {
        lock(&self.transitions).iter().map(|t| t.to).collect()
    }

    pub fn clear(&self) {
        lock(&self.transitions).clear();
    }
}

impl DownloadProgress for RecordingObserver {
    fn on_progress(&self, _name: &str, _current: u64, _total: Option<u64>) {}
}

impl Observer for RecordingObserver {
    fn on_transition(&self, t: &Transition) {
        lock(&self.transitions).push(t.clone());
    }
}
