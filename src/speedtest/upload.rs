use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::cancel::CancelToken;
use super::fallback;
use super::sampler::RateSampler;
use super::transport::Transport;
use super::{
    cache_busted, phase_progress, Direction, ProgressEvent, ProgressReporter, TestPhase,
    UploadRate,
};

/// Size of the body sent by every POST, 2 MiB.
pub const PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

pub struct UploadTest {
    duration: Duration,
    payload_bytes: usize,
    refresh: Duration,
}

#[derive(Debug)]
enum Measurement {
    Measured { bps: f64, bytes: u64, posts: usize },
    Cancelled,
    /// The endpoint could not produce a trustworthy number.
    Unusable(String),
}

impl UploadTest {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            payload_bytes: PAYLOAD_BYTES,
            refresh: Duration::from_millis(100),
        }
    }

    pub fn with_payload_bytes(mut self, bytes: usize) -> Self {
        self.payload_bytes = bytes.max(1);
        self
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Measures upload against `target`, or simulates it from `download_bps`
    /// when there is no target or the endpoint misbehaves.
    ///
    /// Returns `None` on cancellation, or when a simulation is needed but the
    /// download gave nothing to derive it from.
    pub async fn run<R: Rng>(
        &self,
        transport: &dyn Transport,
        target: Option<&Url>,
        download_bps: f64,
        rng: &mut R,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> Option<UploadRate> {
        let Some(target) = target else {
            info!("no upload endpoint configured, simulating upload");
            return fallback::estimate(download_bps, rng);
        };

        match self.measure(transport, target, rng, cancel, progress).await {
            Measurement::Measured { bps, bytes, posts } => {
                info!(
                    "upload finished: {} bytes in {} posts, {:.2} Mbps",
                    bytes,
                    posts,
                    bps / 1_000_000.0
                );
                Some(UploadRate::Measured(bps))
            }
            Measurement::Cancelled => None,
            Measurement::Unusable(reason) => {
                warn!("upload to {} unusable ({}), simulating upload", target, reason);
                fallback::estimate(download_bps, rng)
            }
        }
    }

    async fn measure<R: Rng>(
        &self,
        transport: &dyn Transport,
        target: &Url,
        rng: &mut R,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> Measurement {
        let payload = random_payload(self.payload_bytes, rng);
        debug!("starting upload to {} with {} byte payload", target, payload.len());

        let mut sampler = RateSampler::start(self.refresh);
        let deadline = Instant::now() + self.duration;
        let mut uploaded: u64 = 0;
        let mut posts = 0;

        loop {
            if cancel.is_cancelled() {
                return Measurement::Cancelled;
            }
            if Instant::now() >= deadline {
                break;
            }

            let url = cache_busted(target);
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Measurement::Cancelled,
                _ = sleep_until(deadline) => break,
                sent = transport.upload(&url, payload.clone()) => sent,
            };

            if let Err(err) = sent {
                return Measurement::Unusable(err.to_string());
            }
            uploaded += payload.len() as u64;
            posts += 1;

            if let Some(bps) = sampler.observe(uploaded) {
                progress.live(ProgressEvent::LiveRate {
                    direction: Direction::Upload,
                    bps,
                });
                progress.live(ProgressEvent::Progress(phase_progress(
                    TestPhase::Uploading,
                    sampler.elapsed().as_secs_f64() / self.duration.as_secs_f64(),
                )));
            }
        }

        if posts == 0 {
            return Measurement::Unusable("no upload completed before the deadline".to_string());
        }

        Measurement::Measured {
            bps: sampler.rate(uploaded),
            bytes: uploaded,
            posts,
        }
    }
}

/// Incompressible body so intermediaries cannot inflate the rate.
fn random_payload<R: Rng>(size: usize, rng: &mut R) -> Bytes {
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    Bytes::from(data)
}
