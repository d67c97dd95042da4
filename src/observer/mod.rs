//! User-facing feedback for lifecycle flows.
//!
//! The orchestrator reports every state transition and the resource cache
//! reports download progress; an observer renders both. Observers are
//! purely cosmetic and never influence a flow's outcome.

pub mod interactive;
pub mod json;
pub mod plain;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::DownloadProgress;
use crate::lifecycle::LifecycleState;

/// One orchestrator state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub flow: &'static str,
    pub from: LifecycleState,
    pub to: LifecycleState,
    /// Time spent in `from`.
    pub elapsed: Duration,
}

pub trait Observer: DownloadProgress {
    fn on_transition(&self, t: &Transition);
}

/// Lends an observer to the resource cache as its progress sink.
pub struct ObserverProgress<'a>(pub &'a dyn Observer);

impl DownloadProgress for ObserverProgress<'_> {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        self.0.on_progress(name, current, total);
    }

    fn on_complete(&self, name: &str) {
        self.0.on_complete(name);
    }
}

/// Concrete rendering chosen for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Interactive,
    Plain,
    Json,
}

pub fn make_observer(mode: OutputMode, quiet: bool) -> Arc<dyn Observer> {
    match mode {
        OutputMode::Interactive => Arc::new(interactive::InteractiveObserver::new(quiet)),
        OutputMode::Plain => Arc::new(plain::PlainObserver::new(quiet)),
        OutputMode::Json => Arc::new(json::JsonObserver::new()),
    }
}

/// Reports a download's percentage only when it crosses the next `step`.
struct PercentThrottle {
    step: u64,
    last: Mutex<HashMap<String, u64>>,
}

impl PercentThrottle {
    fn new(step: u64) -> Self {
        Self {
            step,
            last: Mutex::new(HashMap::new()),
        }
    }

    fn advance(&self, name: &str, current: u64, total: Option<u64>) -> Option<u64> {
        let total = total.filter(|t| *t > 0)?;
        let pct = (current.min(total) * 100 / total) / self.step * self.step;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match last.get(name) {
            Some(prev) if *prev >= pct => None,
            _ => {
                last.insert(name.to_string(), pct);
                Some(pct)
            }
        }
    }

    fn forget(&self, name: &str) {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}
