use std::time::Duration;

use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::cancel::CancelToken;
use super::sampler::{cumulative_rate_bps, RateSampler};
use super::transport::Transport;
use super::{cache_busted, phase_progress, Direction, ProgressEvent, ProgressReporter, TestPhase};
use crate::error::TransportError;

/// Below this many bytes an interrupted download scores zero.
pub const PARTIAL_CREDIT_BYTES: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEnd {
    /// The server finished sending.
    Completed,
    /// The phase duration ran out.
    Deadline,
    Cancelled,
    /// An I/O error cut the transfer short.
    Failed,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub bps: f64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub end: TransferEnd,
}

pub struct DownloadTest {
    duration: Duration,
    partial_credit_bytes: u64,
    refresh: Duration,
}

impl DownloadTest {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            partial_credit_bytes: PARTIAL_CREDIT_BYTES,
            refresh: Duration::from_millis(100),
        }
    }

    pub fn with_partial_credit_bytes(mut self, bytes: u64) -> Self {
        self.partial_credit_bytes = bytes;
        self
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Downloads from one randomly chosen target until the stream ends, the
    /// duration runs out or `cancel` fires. Never fails; errors become a
    /// partial-credit rate or zero.
    pub async fn run<R: Rng>(
        &self,
        transport: &dyn Transport,
        targets: &[Url],
        rng: &mut R,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> DownloadResult {
        let Some(target) = targets.choose(rng) else {
            warn!("no download targets configured");
            return DownloadResult {
                bps: 0.0,
                bytes: 0,
                elapsed: Duration::ZERO,
                end: TransferEnd::Failed,
            };
        };
        let url = cache_busted(target);
        debug!("starting download from {}", url);

        let mut sampler = RateSampler::start(self.refresh);
        let deadline = Instant::now() + self.duration;
        let mut downloaded: u64 = 0;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.finish(&sampler, 0, TransferEnd::Cancelled),
            _ = sleep_until(deadline) => return self.finish(&sampler, 0, TransferEnd::Deadline),
            opened = transport.open_download(&url) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return self.partial_credit(&sampler, 0, &err),
        };

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break TransferEnd::Cancelled,
                _ = sleep_until(deadline) => break TransferEnd::Deadline,
                next = stream.next() => next,
            };

            match next {
                None => break TransferEnd::Completed,
                Some(Ok(chunk)) => {
                    downloaded += chunk.len() as u64;

                    if let Some(bps) = sampler.observe(downloaded) {
                        progress.live(ProgressEvent::LiveRate {
                            direction: Direction::Download,
                            bps,
                        });
                        progress.live(ProgressEvent::Progress(phase_progress(
                            TestPhase::Downloading,
                            sampler.elapsed().as_secs_f64() / self.duration.as_secs_f64(),
                        )));
                    }

                    if cancel.is_cancelled() {
                        break TransferEnd::Cancelled;
                    }
                }
                Some(Err(err)) => return self.partial_credit(&sampler, downloaded, &err),
            }
        };

        self.finish(&sampler, downloaded, end)
    }

    fn finish(&self, sampler: &RateSampler, bytes: u64, end: TransferEnd) -> DownloadResult {
        let elapsed = sampler.elapsed();
        let bps = cumulative_rate_bps(elapsed.as_secs_f64(), bytes);
        info!(
            "download finished ({:?}): {} bytes in {:.2}s, {:.2} Mbps",
            end,
            bytes,
            elapsed.as_secs_f64(),
            bps / 1_000_000.0
        );
        DownloadResult {
            bps,
            bytes,
            elapsed,
            end,
        }
    }

    fn partial_credit(&self, sampler: &RateSampler, bytes: u64, err: &TransportError) -> DownloadResult {
        warn!("download interrupted after {} bytes: {}", bytes, err);
        if bytes >= self.partial_credit_bytes {
            return self.finish(sampler, bytes, TransferEnd::Failed);
        }
        DownloadResult {
            bps: 0.0,
            bytes,
            elapsed: sampler.elapsed(),
            end: TransferEnd::Failed,
        }
    }
}
