pub mod cancel;
pub mod download;
pub mod fallback;
pub mod orchestrator;
pub mod ping;
pub mod sampler;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};
use url::Url;

use self::cancel::CancelToken;
use self::ping::LatencyEstimate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestPhase {
    Idle,
    Probing,
    Downloading,
    Uploading,
    Complete,
    Failed,
}

impl TestPhase {
    /// True while a run owns the engine.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TestPhase::Probing | TestPhase::Downloading | TestPhase::Uploading
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TestPhase::Idle => "idle",
            TestPhase::Probing => "latency",
            TestPhase::Downloading => "download",
            TestPhase::Uploading => "upload",
            TestPhase::Complete => "complete",
            TestPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Upload throughput, labeled by where the number came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "bps", rename_all = "snake_case")]
pub enum UploadRate {
    Measured(f64),
    /// Derived from the download rate because no upload endpoint worked.
    Simulated(f64),
}

impl UploadRate {
    pub fn bps(self) -> f64 {
        match self {
            UploadRate::Measured(bps) | UploadRate::Simulated(bps) => bps,
        }
    }

    pub fn is_simulated(self) -> bool {
        matches!(self, UploadRate::Simulated(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub timestamp: DateTime<Utc>,
    pub target_id: String,
    pub target_label: String,
    pub latency_ms: f64,
    /// Successful probes behind `latency_ms`; zero means there was no signal.
    #[serde(default)]
    pub latency_samples: u32,
    #[serde(default)]
    pub jitter_ms: f64,
    pub download_bps: f64,
    pub upload: Option<UploadRate>,
    #[serde(default)]
    pub client_address: Option<String>,
    #[serde(default)]
    pub client_provider: Option<String>,
    #[serde(default)]
    pub client_device_id: Option<String>,
}

impl MeasurementRecord {
    pub fn has_latency(&self) -> bool {
        self.latency_samples > 0
    }

    pub fn upload_bps(&self) -> Option<f64> {
        self.upload.map(UploadRate::bps)
    }
}

/// Updates published to the presentation layer while a run is in flight.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Phase(TestPhase),
    /// Overall run progress, 0 to 100.
    Progress(f64),
    /// One latency probe finished; `None` when it failed.
    LatencySample(Option<f64>),
    LiveRate { direction: Direction, bps: f64 },
    LatencyComplete(LatencyEstimate),
    DownloadComplete { bps: f64 },
    UploadComplete(Option<UploadRate>),
    Completed(MeasurementRecord),
}

/// Longest a milestone waits for room before it is dropped.
pub const MILESTONE_WAIT: Duration = Duration::from_secs(1);

/// Sending half of the progress stream.
///
/// Live readings are dropped when the receiver lags. Milestones wait for room,
/// but never longer than [`MILESTONE_WAIT`] and never past cancellation of the
/// bound run. A reporter without a channel discards everything.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    cancel: Option<CancelToken>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            tx: Some(tx),
            cancel: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            tx: None,
            cancel: None,
        }
    }

    /// Same channel, with milestones abandoned once `cancel` fires.
    pub fn bind(&self, cancel: CancelToken) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: Some(cancel),
        }
    }

    pub fn live(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }

    pub async fn milestone(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let cancelled = async {
            match &self.cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => debug!("run cancelled, milestone dropped"),
            sent = tx.send_timeout(event, MILESTONE_WAIT) => {
                if let Err(SendTimeoutError::Timeout(event)) = sent {
                    warn!("progress consumer is lagging, dropped {:?}", event);
                }
            }
        }
    }
}

static CACHE_BUST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns `url` with a `t` query parameter unique to this request.
pub fn cache_busted(url: &Url) -> Url {
    let seq = CACHE_BUST_SEQ.fetch_add(1, Ordering::Relaxed);
    let stamp = format!("{}-{}", Utc::now().timestamp_millis(), seq);
    let mut busted = url.clone();
    busted.query_pairs_mut().append_pair("t", &stamp);
    busted
}

/// Maps progress within a phase onto the run-wide 0..100 scale.
pub(crate) fn phase_progress(phase: TestPhase, fraction: f64) -> f64 {
    let (from, to) = match phase {
        TestPhase::Probing => (0.0, 10.0),
        TestPhase::Downloading => (10.0, 70.0),
        TestPhase::Uploading => (70.0, 100.0),
        TestPhase::Complete => (100.0, 100.0),
        TestPhase::Idle | TestPhase::Failed => (0.0, 0.0),
    };
    from + (to - from) * fraction.clamp(0.0, 1.0)
}

/// Formats a rate for display, e.g. "125.5 Mbps" or "1.2 Gbps".
pub fn format_speed(bps: f64) -> String {
    let mbps = bps / 1_000_000.0;
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.1} Mbps", mbps)
    } else if mbps > 0.0 {
        format!("{:.0} Kbps", mbps * 1000.0)
    } else {
        "—".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_busted_urls_are_unique_and_keep_existing_query() {
        let base = Url::parse("https://speed.example.net/__down?bytes=25000000").unwrap();
        let a = cache_busted(&base);
        let b = cache_busted(&base);
        assert_ne!(a, b);
        assert!(a.query().unwrap().starts_with("bytes=25000000&t="));
        assert_eq!(base.query(), Some("bytes=25000000"));
    }

    #[test]
    fn phase_progress_spans_whole_run() {
        assert_eq!(phase_progress(TestPhase::Probing, 0.0), 0.0);
        assert_eq!(phase_progress(TestPhase::Downloading, 1.0), 70.0);
        assert_eq!(phase_progress(TestPhase::Uploading, 0.5), 85.0);
        assert_eq!(phase_progress(TestPhase::Uploading, 3.0), 100.0);
    }

    #[test]
    fn format_speed_scales_units() {
        assert_eq!(format_speed(1_200_000_000.0), "1.2 Gbps");
        assert_eq!(format_speed(50_500_000.0), "50.5 Mbps");
        assert_eq!(format_speed(500_000.0), "500 Kbps");
        assert_eq!(format_speed(0.0), "—");
    }

    #[test]
    fn upload_rate_serializes_with_source_label() {
        let json = serde_json::to_string(&UploadRate::Simulated(2_000_000.0)).unwrap();
        assert_eq!(json, r#"{"source":"simulated","bps":2000000.0}"#);
        assert!(UploadRate::Simulated(1.0).is_simulated());
        assert!(!UploadRate::Measured(1.0).is_simulated());
    }

    #[tokio::test(start_paused = true)]
    async fn milestone_gives_up_on_a_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let reporter = ProgressReporter::new(tx);
        reporter.live(ProgressEvent::Progress(1.0));

        let start = tokio::time::Instant::now();
        reporter
            .milestone(ProgressEvent::Phase(TestPhase::Downloading))
            .await;
        let waited = start.elapsed();
        assert!(waited >= MILESTONE_WAIT);
        assert!(waited < MILESTONE_WAIT + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn milestone_is_abandoned_once_the_run_is_cancelled() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancelToken::new();
        let reporter = ProgressReporter::new(tx).bind(cancel.clone());
        reporter.live(ProgressEvent::Progress(1.0));
        cancel.cancel();

        let start = tokio::time::Instant::now();
        reporter.milestone(ProgressEvent::Phase(TestPhase::Idle)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn milestone_is_delivered_when_there_is_room() {
        let (tx, mut rx) = mpsc::channel(1);
        ProgressReporter::new(tx)
            .milestone(ProgressEvent::DownloadComplete { bps: 8.0 })
            .await;
        assert!(matches!(
            rx.try_recv(),
            Ok(ProgressEvent::DownloadComplete { .. })
        ));
    }

    #[test]
    fn active_phases() {
        assert!(TestPhase::Downloading.is_active());
        assert!(!TestPhase::Complete.is_active());
        assert!(!TestPhase::Failed.is_active());
    }
}
