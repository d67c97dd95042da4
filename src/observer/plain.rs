//! Plain text observer: one line per step, no ANSI. For piped output.

use std::io::Write;
use std::sync::Mutex;

use super::{Observer, PercentThrottle, Transition};
use crate::cache::DownloadProgress;
use crate::lifecycle::LifecycleState;
use crate::util::format_size;

pub struct PlainObserver {
    out: Mutex<Box<dyn Write + Send>>,
    quiet: bool,
    throttle: PercentThrottle,
}

impl PlainObserver {
    pub fn new(quiet: bool) -> Self {
        Self::with_writer(Box::new(std::io::stdout()), quiet)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, quiet: bool) -> Self {
        Self {
            out: Mutex::new(out),
            quiet,
            throttle: PercentThrottle::new(10),
        }
    }

    fn line(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "{text}");
    }
}

impl DownloadProgress for PlainObserver {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        if self.quiet {
            return;
        }
        if let Some(pct) = self.throttle.advance(name, current, total) {
            self.line(&format!("  {name}: {pct}%"));
        }
    }

    fn on_complete(&self, name: &str) {
        self.throttle.forget(name);
        if !self.quiet {
            self.line(&format!("  {name}: done"));
        }
    }
}

impl Observer for PlainObserver {
    fn on_transition(&self, t: &Transition) {
        if t.to == LifecycleState::Failed {
            self.line(&format!(
                "{}: failed during {} (after {})",
                t.flow,
                t.from.label(),
                elapsed(t)
            ));
            return;
        }
        if self.quiet && !t.to.is_terminal() {
            return;
        }
        self.line(&format!("{}: {}", t.flow, t.to.label()));
    }
}

fn elapsed(t: &Transition) -> String {
    let secs = t.elapsed.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", t.elapsed.as_millis())
    } else if secs < 120.0 {
        format!("{secs:.1}s")
    } else {
        format!("{}m{}s", t.elapsed.as_secs() / 60, t.elapsed.as_secs() % 60)
    }
}

/// Plain summary of a finished `download` command.
pub fn download_summary(cached: usize, pruned: &[String], bytes: u64) -> String {
    let mut summary = format!("{cached} asset(s) cached ({})", format_size(bytes));
    if !pruned.is_empty() {
        summary.push_str(&format!(", pruned {}", pruned.join(", ")));
    }
    summary
}
