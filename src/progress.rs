//! Terminal progress for sync and pull runs.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

pub struct SyncProgress {
    bar: ProgressBar,
    start_time: Instant,
}

impl SyncProgress {
    pub fn new(enabled: bool) -> Self {
        let bar = if enabled {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:32.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    pub fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    /// Grow the total when it is only known page by page.
    pub fn add_total(&self, more: u64) {
        self.bar.inc_length(more);
    }

    /// One item resolved, either already synced, uploaded or failed.
    pub fn item_done(&self, name: Option<&str>) {
        self.bar.inc(1);
        if let Some(name) = name {
            self.bar.set_message(name.to_string());
        }
    }

    pub fn set_stage(&self, stage: &str) {
        self.bar.set_message(stage.to_string());
    }

    /// Print a line above the bar.
    pub fn println(&self, line: &str) {
        self.bar.suspend(|| eprintln!("{line}"));
    }

    pub fn finish(&self, summary: &str) {
        let elapsed = self.start_time.elapsed();
        self.bar.finish_and_clear();
        eprintln!("{} in {:.1}s", summary, elapsed.as_secs_f64());
    }
}
