//! Terminal feedback for the command-line tools.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::flow::FlowEvent;
use crate::ingest::{IngestionTally, ItemReport, ProgressObserver};
use crate::tips::UiIntent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Progress for a face import of `total` items.
    pub fn import_progress(&self, total: usize) -> ImportProgress {
        let bar = if self.use_pretty() {
            let bar = ProgressBar::new(total as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template("{bar:32} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            Some(bar)
        } else {
            None
        };
        ImportProgress { bar }
    }

    /// One status line per flow event; hint changes are noisy, so only
    /// dialogs and terminal events are shown in plain mode.
    pub fn flow_event(&self, event: &FlowEvent) {
        let line = match event {
            FlowEvent::FrameSize { width, height } => format!("camera streaming {width}x{height}"),
            FlowEvent::Intent { intent, .. } => match intent {
                UiIntent::Primary { hint, .. } if self.use_pretty() => format!("{hint:?}"),
                UiIntent::Dialog { hint, .. } => format!("dialog: {hint:?}"),
                _ => return,
            },
            FlowEvent::MostSimilar { label, similarity } => {
                format!("match: {label} ({similarity:.3})")
            }
            FlowEvent::ConfirmFace { quality } => format!("face captured (quality {quality:.2})"),
            FlowEvent::Rejected { reason } => format!("face rejected: {reason}"),
            FlowEvent::Finished(result) => format!("finished: {}", result.message),
        };
        eprintln!("{line}");
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

pub struct ImportProgress {
    bar: Option<ProgressBar>,
}

impl ImportProgress {
    /// Observer to hand to `IngestionPipeline::with_observer`.
    pub fn observer(&self) -> ProgressObserver {
        let bar = self.bar.clone();
        Arc::new(move |report: &ItemReport| {
            let status = if report.outcome.is_success() {
                "ok"
            } else {
                "failed"
            };
            match &bar {
                Some(bar) => {
                    bar.set_message(format!("{} {}", report.label, status));
                    bar.inc(1);
                }
                None => eprintln!(
                    "[{}/{}] {} {}",
                    report.index + 1,
                    report.total,
                    report.label,
                    status
                ),
            }
        })
    }

    pub fn finish(&self, tally: &IngestionTally) {
        let message = format!(
            "imported {} of {} ({} failed)",
            tally.success_count,
            tally.total(),
            tally.failure_count
        );
        match &self.bar {
            Some(bar) => bar.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
