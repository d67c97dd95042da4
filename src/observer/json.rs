//! JSON-lines observer for machine consumption.

use std::io::Write;
use std::sync::Mutex;

use facet::Facet;

use super::{Observer, PercentThrottle, Transition};
use crate::cache::DownloadProgress;

#[derive(Facet)]
struct TransitionJson {
    kind: String,
    flow: String,
    from: String,
    to: String,
    elapsed_ms: u64,
}

#[derive(Facet)]
struct DownloadJson {
    kind: String,
    asset: String,
    percent: Option<u64>,
    done: bool,
}

#[derive(Facet)]
struct DownloadSummaryJson {
    kind: String,
    cached: usize,
    bytes: u64,
    pruned: Vec<String>,
}

/// JSON line summarising a finished `download` command.
pub fn download_summary(cached: usize, pruned: &[String], bytes: u64) -> String {
    let summary = DownloadSummaryJson {
        kind: "download_summary".into(),
        cached,
        bytes,
        pruned: pruned.to_vec(),
    };
    facet_json::to_string(&summary).unwrap_or_default()
}

pub struct JsonObserver {
    out: Mutex<Box<dyn Write + Send>>,
    throttle: PercentThrottle,
}

impl JsonObserver {
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            throttle: PercentThrottle::new(1),
        }
    }

    fn emit<'a, T: Facet<'a>>(&self, value: &T) {
        match facet_json::to_string(value) {
            Ok(line) => {
                let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
                let _ = writeln!(out, "{line}");
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode observer event"),
        }
    }
}

impl Default for JsonObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadProgress for JsonObserver {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        if let Some(pct) = self.throttle.advance(name, current, total) {
            self.emit(&DownloadJson {
                kind: "download".into(),
                asset: name.to_string(),
                percent: Some(pct),
                done: false,
            });
        }
    }

    fn on_complete(&self, name: &str) {
        self.throttle.forget(name);
        self.emit(&DownloadJson {
            kind: "download".into(),
            asset: name.to_string(),
            percent: None,
            done: true,
        });
    }
}

impl Observer for JsonObserver {
    fn on_transition(&self, t: &Transition) {
        self.emit(&TransitionJson {
            kind: "transition".into(),
            flow: t.flow.into(),
            from: t.from.as_str().into(),
            to: t.to.as_str().into(),
            elapsed_ms: t.elapsed.as_millis() as u64,
        });
    }
}
