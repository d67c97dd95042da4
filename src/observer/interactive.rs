//! Interactive TTY observer: a spinner per state, a progress bar per
//! download, checkmarks as states complete.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::{Observer, Transition};
use crate::cache::DownloadProgress;
use crate::lifecycle::LifecycleState;

const TICK: Duration = Duration::from_millis(80);

struct Bars {
    step: Option<ProgressBar>,
    downloads: HashMap<String, ProgressBar>,
}

pub struct InteractiveObserver {
    multi: MultiProgress,
    bars: Mutex<Bars>,
    quiet: bool,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {msg:20} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn unsized_download_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("  {spinner:.cyan} {msg:20} {bytes}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl InteractiveObserver {
    pub fn new(quiet: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(Bars {
                step: None,
                downloads: HashMap::new(),
            }),
            quiet,
        }
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, Bars> {
        self.bars.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DownloadProgress for InteractiveObserver {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        let mut bars = self.bars();
        let bar = bars.downloads.entry(name.to_string()).or_insert_with(|| {
            let bar = match total {
                Some(len) => {
                    let bar = ProgressBar::new(len);
                    bar.set_style(download_style());
                    bar
                }
                None => {
                    let bar = ProgressBar::new_spinner();
                    bar.set_style(unsized_download_style());
                    bar.enable_steady_tick(TICK);
                    bar
                }
            };
            bar.set_message(name.to_string());
            self.multi.add(bar)
        });
        bar.set_position(current);
    }

    fn on_complete(&self, name: &str) {
        if let Some(bar) = self.bars().downloads.remove(name) {
            bar.finish_and_clear();
        }
        if !self.quiet {
            let _ = self
                .multi
                .println(format!("  {} {name}", style("\u{2713}").green()));
        }
    }
}

impl Observer for InteractiveObserver {
    fn on_transition(&self, t: &Transition) {
        let mut bars = self.bars();
        if let Some(prev) = bars.step.take() {
            if t.to == LifecycleState::Failed {
                prev.abandon_with_message(format!(
                    "{} {} failed",
                    style("\u{2717}").red(),
                    t.from.label()
                ));
            } else if self.quiet {
                prev.finish_and_clear();
            } else {
                prev.finish_with_message(format!(
                    "{} {} ({:.1}s)",
                    style("\u{2713}").green(),
                    t.from.label(),
                    t.elapsed.as_secs_f64()
                ));
            }
        }

        if t.to.is_terminal() {
            if t.to != LifecycleState::Failed {
                let _ = self.multi.println(format!(
                    "{} {}",
                    style(t.flow).bold(),
                    style(t.to.label()).green()
                ));
            }
            return;
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_message(format!("{}...", t.to.label()));
        bar.enable_steady_tick(TICK);
        bars.step = Some(bar);
    }
}
