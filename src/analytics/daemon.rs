//! `cfdev analyticsd`: drains the event spool to the analytics endpoint.
//!
//! The spool is taken by renaming it aside, so producers appending
//! concurrently start a fresh file and no line is read twice. Events that
//! fail to deliver are discarded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{AnalyticsEvent, AnalyticsToggle};
use crate::config::SystemConfig;
use crate::error::CfdevError;
use crate::paths;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait EventUploader: Send + Sync {
    async fn upload(&self, endpoint: &str, event: &AnalyticsEvent) -> Result<(), CfdevError>;
}

pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpUploader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventUploader for HttpUploader {
    async fn upload(&self, endpoint: &str, event: &AnalyticsEvent) -> Result<(), CfdevError> {
        let body = facet_json::to_string(event).map_err(|e| CfdevError::AnalyticsDelivery {
            message: format!("encoding event: {e}"),
        })?;
        let resp = self
            .client
            .post(endpoint)
            .timeout(UPLOAD_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| CfdevError::AnalyticsDelivery {
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(CfdevError::AnalyticsDelivery {
                message: format!("{endpoint} returned {}", resp.status()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub discarded: usize,
}

/// Where events go and where they wait.
#[derive(Debug, Clone)]
pub struct SpoolDrain {
    pub spool: PathBuf,
    pub toggle: PathBuf,
    pub endpoint: Option<String>,
    pub custom_endpoint: Option<String>,
}

impl SpoolDrain {
    pub fn from_config(sys_config: &SystemConfig) -> Self {
        Self {
            spool: paths::spool_file(&sys_config.home),
            toggle: paths::toggle_file(&sys_config.home),
            endpoint: sys_config.config.analytics.endpoint.clone(),
            custom_endpoint: sys_config.config.analytics.custom_endpoint.clone(),
        }
    }

    fn taken_path(&self) -> PathBuf {
        self.spool.with_extension("sending")
    }

    /// Take everything spooled so far and try to deliver it once.
    pub async fn drain_once(&self, uploader: &dyn EventUploader) -> Result<DrainReport, CfdevError> {
        let taken = self.taken_path();
        match tokio::fs::rename(&self.spool, &taken).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DrainReport::default());
            }
            Err(e) => {
                return Err(CfdevError::io(format!("taking {}", self.spool.display()), e));
            }
        }
        let contents = tokio::fs::read_to_string(&taken)
            .await
            .map_err(|e| CfdevError::io(format!("reading {}", taken.display()), e))?;
        remove_quietly(&taken).await;

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut report = DrainReport::default();

        // Consent may have been withdrawn after the events were spooled.
        let toggle = AnalyticsToggle::load(&self.toggle)?;
        let endpoint = if !toggle.enabled() {
            None
        } else if toggle.is_custom() {
            self.custom_endpoint.as_deref()
        } else {
            self.endpoint.as_deref()
        };
        let Some(endpoint) = endpoint else {
            report.discarded = lines.len();
            tracing::debug!(discarded = report.discarded, "no analytics destination, discarding");
            return Ok(report);
        };

        for line in lines {
            let event: AnalyticsEvent = match facet_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding malformed spool line");
                    report.discarded += 1;
                    continue;
                }
            };
            match uploader.upload(endpoint, &event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::debug!(event = %event.name, error = %e, "delivery failed, discarding");
                    report.discarded += 1;
                }
            }
        }
        Ok(report)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove taken spool");
    }
}

/// Daemon main loop. Flushes on a fixed interval and once more on shutdown.
pub async fn run(sys_config: &SystemConfig) -> Result<(), CfdevError> {
    let drain = SpoolDrain::from_config(sys_config);
    let uploader = HttpUploader::new();
    tracing::info!(spool = %drain.spool.display(), "analyticsd started");

    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush(&drain, &uploader).await;
            }
            _ = &mut shutdown => {
                flush(&drain, &uploader).await;
                tracing::info!("analyticsd stopping");
                return Ok(());
            }
        }
    }
}

async fn flush(drain: &SpoolDrain, uploader: &dyn EventUploader) {
    match drain.drain_once(uploader).await {
        Ok(report) if report.delivered + report.discarded > 0 => {
            tracing::info!(delivered = report.delivered, discarded = report.discarded, "spool flushed");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "spool flush failed"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
