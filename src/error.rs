use miette::Diagnostic;
use thiserror::Error;

/// Lifecycle stage an error belongs to, so the user knows which command to re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Start,
    Provision,
    Stop,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Fetch => "fetch",
            Stage::Start => "start",
            Stage::Provision => "provision",
            Stage::Stop => "stop",
        })
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CfdevError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no VM driver available for host platform '{os}'")]
    #[diagnostic(help("cfdev supports macOS (hyperkit), Windows (Hyper-V) and Linux (KVM)"))]
    UnsupportedPlatform { os: String },

    #[error("fetch failed for {name} after {attempts} attempt(s): {message}")]
    #[diagnostic(help("check your network connection and re-run `cfdev start` or `cfdev download`"))]
    FetchFailed {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("fetch failed for {name}: checksum mismatch (expected {expected}, got {actual})")]
    #[diagnostic(help("the downloaded file was discarded; verify the asset URL and checksum"))]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("VM start failed ({driver}): {message}")]
    #[diagnostic(help("fix the reported problem and re-run `cfdev start`"))]
    DriverStartFailed { driver: String, message: String },

    #[error("VM stop failed ({driver}): {message}")]
    #[diagnostic(help("re-run `cfdev stop`; `cfdev destroy` removes the VM entirely"))]
    DriverStopFailed { driver: String, message: String },

    #[error("helper '{label}' did not become ready within {timeout_s}s")]
    #[diagnostic(help("check the helper log under the cfdev state directory"))]
    HelperStartupTimeout { label: String, timeout_s: u64 },

    #[error("provisioning failed: {message}")]
    #[diagnostic(help("the VM is still running; re-run `cfdev provision` or `cfdev start` to retry"))]
    ProvisioningFailed { message: String },

    #[error("the VM is not running")]
    #[diagnostic(help("run `cfdev start` first"))]
    VmNotRunning,

    #[error("analytics delivery failed: {message}")]
    AnalyticsDelivery { message: String },

    #[error("interrupted during {stage}")]
    Interrupted { stage: Stage },
}

impl CfdevError {
    /// Lifecycle stage that produced this error, if it came from one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            CfdevError::FetchFailed { .. } | CfdevError::ChecksumMismatch { .. } => {
                Some(Stage::Fetch)
            }
            CfdevError::DriverStartFailed { .. }
            | CfdevError::HelperStartupTimeout { .. }
            | CfdevError::UnsupportedPlatform { .. } => Some(Stage::Start),
            CfdevError::ProvisioningFailed { .. } | CfdevError::VmNotRunning => {
                Some(Stage::Provision)
            }
            CfdevError::DriverStopFailed { .. } => Some(Stage::Stop),
            CfdevError::Interrupted { stage } => Some(*stage),
            _ => None,
        }
    }

    /// Display text followed by every `source()` in the chain.
    pub fn detail(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CfdevError::Io {
            context: context.into(),
            source,
        }
    }
}
