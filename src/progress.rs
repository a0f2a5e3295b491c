//! Terminal progress for client transfers
//!
//! Renders chunk progress reported by the transfer engine as an indicatif
//! bar when the total is known (uploads) and a byte-counting spinner when it
//! is not (downloads).

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::transfer::TransferObserver;

pub struct TransferProgress {
    bar: ProgressBar,
    start_time: Instant,
}

impl TransferProgress {
    /// A disabled progress draws nothing but still counts bytes.
    pub fn new(enabled: bool) -> Self {
        let bar = if enabled {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Abandon the bar with a failure message.
    pub fn fail(&self, msg: &str) {
        self.bar.abandon_with_message(format!("failed: {msg}"));
    }

    /// Pass a transfer result through, stopping the bar if it failed.
    pub fn settle<T>(&self, result: crate::Result<T>) -> crate::Result<T> {
        if let Err(e) = &result {
            self.fail(&e.to_string());
        }
        result
    }
}

impl TransferObserver for TransferProgress {
    fn started(&self, name: &str, total: Option<u64>) {
        let style = match total {
            Some(total) => {
                self.bar.set_length(total);
                ProgressStyle::default_bar()
                    .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> ")
            }
            None => ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} {bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        };
        self.bar.set_style(style);
        self.bar.set_message(name.to_string());
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    fn chunk(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    fn finished(&self, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.1 {
            format!(" @ {:.1} MB/s", bytes as f64 / elapsed / 1_048_576.0)
        } else {
            String::new()
        };
        self.bar.finish_with_message(format!(
            "done: {:.1} MB in {:.1}s{}",
            bytes as f64 / 1_048_576.0,
            elapsed,
            throughput
        ));
    }
}
