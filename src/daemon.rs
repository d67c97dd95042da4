//! Background helper processes: the privileged network helper, the
//! analytics daemon, and VM processes for backends that run the hypervisor
//! as a plain child process.
//!
//! Each daemon is identified by a label and tracked through a pid file in
//! the daemons directory. `ensure_running` is idempotent: a passing health
//! probe short-circuits, otherwise the daemon is spawned detached and the
//! probe is polled until it passes or the startup timeout elapses.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SystemConfig;
use crate::error::CfdevError;

/// Label of the privileged network helper shared by the unix backends.
pub const NET_HELPER_LABEL: &str = "cfdev.net-helper";
/// Label of the analytics delivery daemon.
pub const ANALYTICS_LABEL: &str = "cfdev.analyticsd";

const PROBE_INTERVAL: Duration = Duration::from_millis(200);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// How to tell that a daemon is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The recorded process is alive.
    Process,
    /// The daemon is listening on this unix socket.
    Socket(PathBuf),
    /// The daemon accepts TCP connections on this address.
    Tcp(String),
}

#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// stdout/stderr destination; discarded when unset.
    pub log_path: Option<PathBuf>,
    pub probe: Probe,
    pub startup_timeout: Duration,
}

#[async_trait]
pub trait DaemonRunner: Send + Sync {
    /// Start the daemon unless its probe already passes. Blocks until the
    /// probe passes or `spec.startup_timeout` elapses.
    async fn ensure_running(&self, spec: &DaemonSpec) -> Result<(), CfdevError>;

    /// Stop the daemon. Succeeds when it is not running.
    async fn stop(&self, label: &str) -> Result<(), CfdevError>;

    async fn is_running(&self, label: &str) -> bool;
}

/// Spec for the privileged network helper configured under `[helper]`.
pub fn net_helper_spec(sys_config: &SystemConfig) -> DaemonSpec {
    let helper = &sys_config.config.helper;
    let socket = sys_config.state_dir().join("net-helper.sock");
    let mut args = helper.args.clone();
    args.push("--socket".into());
    args.push(socket.display().to_string());
    DaemonSpec {
        label: NET_HELPER_LABEL.into(),
        program: PathBuf::from(&helper.command),
        args,
        log_path: Some(crate::paths::daemons_dir(&sys_config.home).join("net-helper.log")),
        probe: Probe::Socket(socket),
        startup_timeout: Duration::from_secs(helper.startup_timeout_s),
    }
}

/// Spec for `cfdev analyticsd`, run from the current executable.
pub fn analytics_spec(sys_config: &SystemConfig) -> Result<DaemonSpec, CfdevError> {
    let exe = std::env::current_exe()
        .map_err(|e| CfdevError::io("getting current executable path", e))?;
    let mut args = Vec::new();
    if let Some(ref path) = sys_config.config_path {
        args.push("--config".into());
        args.push(path.display().to_string());
    }
    args.push("analyticsd".into());
    Ok(DaemonSpec {
        label: ANALYTICS_LABEL.into(),
        program: exe,
        args,
        log_path: Some(crate::paths::daemons_dir(&sys_config.home).join("analyticsd.log")),
        probe: Probe::Process,
        startup_timeout: Duration::from_secs(10),
    })
}

// ── ProcessDaemonRunner ─────────────────────────────────────────────

/// Runs daemons as detached child processes tracked by pid files.
#[derive(Debug, Clone)]
pub struct ProcessDaemonRunner {
    dir: PathBuf,
}

impl ProcessDaemonRunner {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn pid_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.pid"))
    }

    fn read_pid(&self, label: &str) -> Option<u32> {
        let contents = std::fs::read_to_string(self.pid_path(label)).ok()?;
        contents.trim().parse().ok()
    }

    fn probe_passes(&self, spec: &DaemonSpec) -> bool {
        match &spec.probe {
            Probe::Process => self.read_pid(&spec.label).is_some_and(process_alive),
            Probe::Socket(path) => socket_accepts(path),
            Probe::Tcp(addr) => tcp_accepts(addr),
        }
    }

    fn spawn(&self, spec: &DaemonSpec) -> Result<std::process::Child, CfdevError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CfdevError::io(format!("creating daemon directory {}", self.dir.display()), e)
        })?;

        let (stdout, stderr) = match &spec.log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| CfdevError::io(format!("opening {}", path.display()), e))?;
                let err = log
                    .try_clone()
                    .map_err(|e| CfdevError::io(format!("opening {}", path.display()), e))?;
                (Stdio::from(log), Stdio::from(err))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        detach(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            CfdevError::io(format!("spawning {} ({})", spec.label, spec.program.display()), e)
        })?;

        let pid_path = self.pid_path(&spec.label);
        std::fs::write(&pid_path, child.id().to_string())
            .map_err(|e| CfdevError::io(format!("writing pid file {}", pid_path.display()), e))?;
        tracing::info!(label = %spec.label, pid = child.id(), "daemon spawned");
        Ok(child)
    }
}

#[async_trait]
impl DaemonRunner for ProcessDaemonRunner {
    async fn ensure_running(&self, spec: &DaemonSpec) -> Result<(), CfdevError> {
        if self.probe_passes(spec) {
            tracing::debug!(label = %spec.label, "daemon already running");
            return Ok(());
        }

        let mut child = self.spawn(spec)?;
        let deadline = tokio::time::Instant::now() + spec.startup_timeout;

        loop {
            if self.probe_passes(spec) {
                return Ok(());
            }
            // A child that already exited will never pass the probe.
            let exited = match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                // Already reaped by a liveness check.
                Err(_) => Some("exited".to_string()),
            };
            if let Some(status) = exited {
                let _ = std::fs::remove_file(self.pid_path(&spec.label));
                return Err(CfdevError::io(
                    format!("daemon {} exited during startup", spec.label),
                    std::io::Error::other(status),
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                // Leave nothing behind that a retry would orphan.
                tracing::warn!(
                    label = %spec.label,
                    pid = child.id(),
                    "daemon never became ready, killing"
                );
                let _ = child.kill();
                let _ = child.wait();
                let _ = std::fs::remove_file(self.pid_path(&spec.label));
                return Err(CfdevError::HelperStartupTimeout {
                    label: spec.label.clone(),
                    timeout_s: spec.startup_timeout.as_secs(),
                });
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    async fn stop(&self, label: &str) -> Result<(), CfdevError> {
        let pid_path = self.pid_path(label);
        let Some(pid) = self.read_pid(label) else {
            let _ = std::fs::remove_file(&pid_path);
            return Ok(());
        };

        if process_alive(pid) {
            tracing::info!(label, pid, "stopping daemon");
            terminate(pid);
            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            while process_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
            if process_alive(pid) {
                tracing::warn!(label, pid, "daemon ignored termination, killing");
                force_kill(pid);
            }
        }

        match std::fs::remove_file(&pid_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CfdevError::io(format!("removing {}", pid_path.display()), e)),
        }
    }

    async fn is_running(&self, label: &str) -> bool {
        self.read_pid(label).is_some_and(process_alive)
    }
}

// ── Platform helpers ────────────────────────────────────────────────

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let pid = Pid::from_raw(raw);
    // Reap our own exited children; a zombie still answers signal 0.
    if let Ok(status) = waitpid(pid, Some(WaitPidFlag::WNOHANG))
        && !matches!(status, WaitStatus::StillAlive)
    {
        return false;
    }
    kill(pid, None).is_ok()
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Ok(raw) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Ok(raw) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

#[cfg(windows)]
fn terminate(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .output();
}

#[cfg(windows)]
fn force_kill(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output();
}

#[cfg(unix)]
fn socket_accepts(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(windows)]
fn socket_accepts(path: &Path) -> bool {
    path.exists()
}

fn tcp_accepts(addr: &str) -> bool {
    use std::net::ToSocketAddrs;
    let Ok(mut addrs) = addr.to_socket_addrs() else {
        return false;
    };
    addrs.any(|a| std::net::TcpStream::connect_timeout(&a, Duration::from_millis(500)).is_ok())
}
