use std::time::Duration;

use tokio::time::Instant;

/// Cumulative-average rate in bits per second.
///
/// `elapsed_secs` is measured from the start of the transfer, not from the
/// previous sample, so bursts are smoothed out. Zero, negative or non-finite
/// elapsed time yields 0.
pub fn cumulative_rate_bps(elapsed_secs: f64, cumulative_bytes: u64) -> f64 {
    if !elapsed_secs.is_finite() || elapsed_secs <= 0.0 {
        return 0.0;
    }
    (cumulative_bytes as f64 * 8.0) / elapsed_secs
}

/// Tracks one transfer: start time and throttled live readings.
pub struct RateSampler {
    start: Instant,
    refresh: Duration,
    last_emit: Option<Instant>,
}

impl RateSampler {
    pub fn start(refresh: Duration) -> Self {
        Self {
            start: Instant::now(),
            refresh,
            last_emit: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Current rate for the bytes moved so far.
    pub fn rate(&self, cumulative_bytes: u64) -> f64 {
        cumulative_rate_bps(self.elapsed().as_secs_f64(), cumulative_bytes)
    }

    /// Records an observation. Returns the rate when a live reading is due,
    /// at most once per refresh interval.
    pub fn observe(&mut self, cumulative_bytes: u64) -> Option<f64> {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.refresh {
                return None;
            }
        }
        let rate = cumulative_rate_bps(now.duration_since(self.start).as_secs_f64(), cumulative_bytes);
        self.last_emit = Some(now);
        Some(rate)
    }
}
