//! Terminal progress for flushes
//!
//! Fed by the two-phase item protocol: the bar is a spinner until the
//! estimate arrives, then turns into a determinate bar.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::callbacks::ItemProgress;
use crate::protocol::timeouts::PROGRESS_TICK_MS;

pub struct FlushProgress {
    bar: ProgressBar,
    start_time: Instant,
    show_items: bool,
}

impl FlushProgress {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(PROGRESS_TICK_MS));
        Self {
            bar,
            start_time: Instant::now(),
            show_items: verbose,
        }
    }

    /// No terminal output; used when stdout is not interactive
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            start_time: Instant::now(),
            show_items: false,
        }
    }

    pub fn handle(&self, event: ItemProgress) {
        match event {
            ItemProgress::Estimation { items } => {
                self.bar.set_length(items as u64);
                self.bar.set_position(0);
                self.bar.set_style(
                    ProgressStyle::default_bar()
                        .template("  {bar:30.green/white} {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
            }
            ItemProgress::Progress { uid, name } => {
                self.bar.inc(1);
                if self.show_items {
                    self.bar.suspend(|| println!("  committed {name} ({uid})"));
                }
                self.bar.set_message(name);
            }
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish_success(&self, items: u64, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        self.bar.finish_with_message(format!(
            "Committed {} items ({:.1} MB) in {:.2}s",
            items,
            bytes as f64 / 1_048_576.0,
            elapsed
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar.abandon_with_message(format!("Failed {msg}"));
    }
}
