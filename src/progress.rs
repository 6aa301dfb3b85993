use crate::config::ProgressConfig;
use log::info;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Periodic progress lines for a run over a known number of blocks.
///
/// Reports when `every_blocks` blocks or `interval` time have passed since the last line,
/// whichever comes first. The ETA is the mean of the last `eta_window` block durations times
/// the remaining block count.
pub struct ProgressReporter {
    label: &'static str,
    total: u64,
    done: u64,
    every_blocks: u64,
    interval: Duration,
    samples: VecDeque<Duration>,
    window: usize,
    last_report: Instant,
    last_report_done: u64,
}

impl ProgressReporter {
    pub fn new(label: &'static str, total: u64, config: &ProgressConfig) -> Self {
        Self {
            label,
            total,
            done: 0,
            every_blocks: config.every_blocks.max(1),
            interval: config.interval,
            samples: VecDeque::with_capacity(config.eta_window),
            window: config.eta_window.max(1),
            last_report: Instant::now(),
            last_report_done: 0,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.done as f64 / self.total as f64 * 100.0
    }

    pub fn eta(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: Duration = self.samples.iter().sum();
        let mean = sum / self.samples.len() as u32;
        let remaining = self.total.saturating_sub(self.done);
        Some(mean.saturating_mul(u32::try_from(remaining).unwrap_or(u32::MAX)))
    }

    fn push_sample(&mut self, elapsed: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    /// Records one finished block and logs a progress line if one is due.
    /// Returns whether a line was logged.
    pub fn record(&mut self, block_number: u64, elapsed: Duration) -> bool {
        self.done += 1;
        self.push_sample(elapsed);

        let due = self.done - self.last_report_done >= self.every_blocks
            || self.last_report.elapsed() >= self.interval;
        if !due {
            return false;
        }
        self.last_report = Instant::now();
        self.last_report_done = self.done;

        let eta = self
            .eta()
            .map(|x| humantime::format_duration(Duration::from_secs(x.as_secs())).to_string())
            .unwrap_or_else(|| "unknown".into());
        info!(
            "{}: {:.1}% ({}/{} blocks, at block {block_number}), ETA {eta}",
            self.label,
            self.percent(),
            self.done,
            self.total,
        );
        true
    }
}
