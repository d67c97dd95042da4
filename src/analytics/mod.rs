//! Best-effort lifecycle telemetry.
//!
//! Commands record events through [`AnalyticsClient`]. Recording only
//! appends to a local spool under a short timeout; the `analyticsd` daemon
//! (see [`daemon`]) delivers the spool out of process. Nothing here may
//! fail or stall a command: callers log the returned error and move on.

pub mod daemon;
pub mod toggle;

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use facet::Facet;
use tokio::io::AsyncWriteExt;

use crate::error::CfdevError;
pub use toggle::AnalyticsToggle;

pub const CONSENT_MESSAGE: &str = "cfdev collects anonymous usage data to help improve the product.\n\
     Are you ok with cfdev collecting anonymous usage data?";

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct AnalyticsEvent {
    pub name: String,
    pub timestamp_ms: u64,
    pub properties: BTreeMap<String, String>,
}

impl AnalyticsEvent {
    pub fn new(name: &str, properties: BTreeMap<String, String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            name: name.to_string(),
            timestamp_ms,
            properties,
        }
    }
}

#[async_trait]
pub trait AnalyticsClient: Send + Sync {
    fn enabled(&self) -> bool;

    /// Record one event. Errors are advisory.
    async fn event(
        &self,
        name: &str,
        properties: BTreeMap<String, String>,
    ) -> Result<(), CfdevError>;

    /// Ask for consent once per process if it was never given.
    fn prompt_opt_in_if_needed(&self, message: &str) -> Result<(), CfdevError>;
}

/// Interactive yes/no consent question.
pub trait ConsentPrompt: Send + Sync {
    /// `Ok(None)` when no answer can be obtained (no terminal, cancelled).
    fn ask(&self, message: &str) -> Result<Option<bool>, CfdevError>;
}

pub struct InquirePrompt;

impl ConsentPrompt for InquirePrompt {
    fn ask(&self, message: &str) -> Result<Option<bool>, CfdevError> {
        if !std::io::stdin().is_terminal() || !std::io::stdout().is_terminal() {
            return Ok(None);
        }
        match inquire::Confirm::new(message).with_default(false).prompt() {
            Ok(answer) => Ok(Some(answer)),
            Err(
                inquire::InquireError::OperationCanceled
                | inquire::InquireError::OperationInterrupted,
            ) => Ok(None),
            Err(other) => Err(CfdevError::Validation {
                message: format!("prompt error: {other}"),
            }),
        }
    }
}

/// Outbound queue for recorded events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn enqueue(&self, event: &AnalyticsEvent) -> Result<(), CfdevError>;
}

/// Appends events as JSON lines to the spool drained by `analyticsd`.
pub struct SpoolSink {
    path: PathBuf,
}

impl SpoolSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl EventSink for SpoolSink {
    async fn enqueue(&self, event: &AnalyticsEvent) -> Result<(), CfdevError> {
        let mut line = facet_json::to_string(event).map_err(|e| CfdevError::AnalyticsDelivery {
            message: format!("encoding event: {e}"),
        })?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CfdevError::io(format!("creating {}", parent.display()), e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CfdevError::io(format!("opening {}", self.path.display()), e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| CfdevError::io(format!("appending to {}", self.path.display()), e))
    }
}

/// Consent-gated client in front of an [`EventSink`].
pub struct Analytics {
    toggle: Mutex<AnalyticsToggle>,
    prompt: Box<dyn ConsentPrompt>,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
    prompted: AtomicBool,
}

impl Analytics {
    pub fn new(
        toggle: AnalyticsToggle,
        prompt: Box<dyn ConsentPrompt>,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            toggle: Mutex::new(toggle),
            prompt,
            sink,
            timeout,
            prompted: AtomicBool::new(false),
        }
    }

    fn toggle(&self) -> MutexGuard<'_, AnalyticsToggle> {
        self.toggle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AnalyticsClient for Analytics {
    fn enabled(&self) -> bool {
        self.toggle().enabled()
    }

    async fn event(
        &self,
        name: &str,
        properties: BTreeMap<String, String>,
    ) -> Result<(), CfdevError> {
        let merged = {
            let toggle = self.toggle();
            if !toggle.enabled() {
                return Ok(());
            }
            let mut merged = toggle.props().clone();
            merged.extend(properties);
            merged
        };
        let event = AnalyticsEvent::new(name, merged);
        match tokio::time::timeout(self.timeout, self.sink.enqueue(&event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CfdevError::AnalyticsDelivery {
                message: e.detail(),
            }),
            Err(_) => Err(CfdevError::AnalyticsDelivery {
                message: format!("enqueue timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }

    fn prompt_opt_in_if_needed(&self, message: &str) -> Result<(), CfdevError> {
        if self.toggle().defined() || self.prompted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(answer) = self.prompt.ask(message)? else {
            tracing::debug!("no consent answer, analytics stays undefined");
            return Ok(());
        };
        self.toggle().set_cf_analytics_enabled(answer)
    }
}

/// One-line description of the consent state for `cfdev telemetry`.
pub fn status_line(toggle: &AnalyticsToggle) -> &'static str {
    match (toggle.defined(), toggle.enabled(), toggle.is_custom()) {
        (false, _, _) => "Telemetry has not been configured (OFF until you opt in)",
        (true, true, true) => "Telemetry is turned ON (custom endpoint)",
        (true, true, false) => "Telemetry is turned ON",
        (true, false, _) => "Telemetry is turned OFF",
    }
}
