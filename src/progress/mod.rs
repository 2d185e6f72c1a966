use crate::stats::{SharedStats, Snapshot};
use std::fmt;
use std::io::Write;
use std::time::Duration;
use tokio::time;
use tracing::info;

/// Redraws the single `\r`-terminated progress line on stdout.
#[derive(Clone)]
pub struct ProgressReporter {
    stats: SharedStats,
    expected: u64,
    refresh: Duration,
}

pub struct ProgressLine {
    pub snapshot: Snapshot,
    pub expected: u64,
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent / received: {} / {}, total {}, avg {:.4} ms",
            self.snapshot.sent,
            self.snapshot.received,
            self.expected,
            self.snapshot.average_latency_ms()
        )
    }
}

impl ProgressReporter {
    pub fn new(stats: SharedStats, expected: u64, refresh: Duration) -> Self {
        Self {
            stats,
            expected,
            refresh,
        }
    }

    pub fn line(&self) -> ProgressLine {
        ProgressLine {
            snapshot: self.stats.snapshot(),
            expected: self.expected,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.expected > 0 && self.stats.snapshot().received >= self.expected
    }

    pub async fn run(self) {
        let mut interval = time::interval(self.refresh);
        let mut announced = false;

        loop {
            interval.tick().await;
            self.draw("");

            if !announced && self.is_complete() {
                info!("all {} exchanges answered", self.expected);
                announced = true;
            }
        }
    }

    /// Draws the last line and moves the cursor off it.
    pub fn finish(&self) {
        self.draw("\r\n");
    }

    fn draw(&self, suffix: &str) {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r{}{}", self.line(), suffix);
        let _ = out.flush();
    }
}
