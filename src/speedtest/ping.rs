use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::cancel::CancelToken;
use super::transport::Transport;
use super::{cache_busted, phase_progress, ProgressEvent, ProgressReporter, TestPhase};
use crate::error::TransportError;

/// Probes per run. Sequential, so they see an idle link.
pub const PROBE_COUNT: usize = 5;

pub struct PingTest {
    samples: Vec<f64>,
    probe_timeout: Duration,
}

impl PingTest {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            samples: Vec::with_capacity(PROBE_COUNT),
            probe_timeout,
        }
    }

    pub async fn run(
        &mut self,
        transport: &dyn Transport,
        url: &Url,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> LatencyEstimate {
        self.samples.clear();
        let mut attempts = 0;

        for i in 0..PROBE_COUNT {
            if cancel.is_cancelled() {
                debug!("latency probing cancelled after {} probes", i);
                break;
            }
            attempts += 1;

            let target = cache_busted(url);
            let start = Instant::now();
            let timed = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("latency probing cancelled during probe {}", i + 1);
                    break;
                }
                timed = tokio::time::timeout(self.probe_timeout, transport.probe(&target)) => timed,
            };
            let outcome = match timed {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    millis: self.probe_timeout.as_millis() as u64,
                }),
            };

            let sample = match outcome {
                Ok(()) => {
                    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                    self.samples.push(elapsed);
                    Some(elapsed)
                }
                Err(err) => {
                    warn!("latency probe {} to {} failed: {}", i + 1, url, err);
                    None
                }
            };

            progress.live(ProgressEvent::LatencySample(sample));
            progress.live(ProgressEvent::Progress(phase_progress(
                TestPhase::Probing,
                (i + 1) as f64 / PROBE_COUNT as f64,
            )));
        }

        self.calculate_result(attempts)
    }

    fn calculate_result(&self, attempts: usize) -> LatencyEstimate {
        if self.samples.is_empty() {
            return LatencyEstimate {
                attempts,
                ..LatencyEstimate::default()
            };
        }

        let avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        let jitter = if self.samples.len() > 1 {
            let variance: f64 = self.samples.iter().map(|&x| (x - avg).powi(2)).sum::<f64>()
                / (self.samples.len() - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };
        let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);

        LatencyEstimate {
            avg_ms: avg,
            jitter_ms: jitter,
            min_ms: min,
            samples: self.samples.len(),
            attempts,
        }
    }
}

/// Reduced result of one probe sequence.
///
/// `avg_ms` is 0 when no probe succeeded; check `has_signal` before treating
/// it as a real round-trip time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyEstimate {
    pub avg_ms: f64,
    pub jitter_ms: f64,
    pub min_ms: f64,
    pub samples: usize,
    pub attempts: usize,
}

impl LatencyEstimate {
    pub fn has_signal(&self) -> bool {
        self.samples > 0
    }
}
