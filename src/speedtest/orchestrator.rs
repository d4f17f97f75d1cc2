use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{info, warn};

use super::cancel::CancelToken;
use super::download::DownloadTest;
use super::ping::PingTest;
use super::transport::Transport;
use super::upload::UploadTest;
use super::{phase_progress, MeasurementRecord, ProgressEvent, ProgressReporter, TestPhase};
use crate::catalog::{select_endpoint, EndpointDescriptor, ServerCatalog};
use crate::client_info::ClientInfo;
use crate::error::EngineError;
use crate::settings::Settings;
use crate::store::ResultsStore;

/// Timing and sizing knobs for one run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_duration: Duration,
    pub upload_duration: Duration,
    pub probe_timeout: Duration,
    pub upload_payload_bytes: usize,
    pub partial_credit_bytes: u64,
    pub refresh: Duration,
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            download_duration: settings.download_duration(),
            upload_duration: settings.upload_duration(),
            probe_timeout: settings.probe_timeout(),
            upload_payload_bytes: settings.upload_payload_bytes,
            partial_credit_bytes: settings.partial_credit_bytes,
            refresh: settings.refresh(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Published engine state.
#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: TestPhase,
    /// The last run was cancelled rather than completed.
    pub cancelled: bool,
    run_id: u64,
    cancel: Option<CancelToken>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: TestPhase::Idle,
            cancelled: false,
            run_id: 0,
            cancel: None,
        }
    }
}

/// Runs latency, download and upload in sequence, one run at a time.
///
/// Cloning yields another handle to the same engine, so one task can drive
/// `start` while another calls `cancel`.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    catalog: Arc<dyn ServerCatalog>,
    store: Arc<dyn ResultsStore>,
    config: Mutex<EngineConfig>,
    state: watch::Sender<RunState>,
    rng: Mutex<StdRng>,
    selected: Mutex<Option<String>>,
    client: Mutex<ClientInfo>,
    next_run: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        catalog: Arc<dyn ServerCatalog>,
        store: Arc<dyn ResultsStore>,
        config: EngineConfig,
        rng: StdRng,
    ) -> Self {
        let (state, _) = watch::channel(RunState::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                catalog,
                store,
                config: Mutex::new(config),
                state,
                rng: Mutex::new(rng),
                selected: Mutex::new(None),
                client: Mutex::new(ClientInfo::default()),
                next_run: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    pub fn phase(&self) -> TestPhase {
        self.inner.state.borrow().phase
    }

    /// Chooses the server for later runs; `None` means the catalog default.
    pub fn select_server(&self, id: Option<String>) {
        if let Ok(mut selected) = self.inner.selected.lock() {
            *selected = id;
        }
    }

    pub fn selected_server(&self) -> Option<String> {
        self.inner.selected.lock().ok().and_then(|s| s.clone())
    }

    /// Replaces timing settings; takes effect at the next `start`.
    pub fn set_config(&self, config: EngineConfig) {
        if let Ok(mut current) = self.inner.config.lock() {
            *current = config;
        }
    }

    pub fn set_client_info(&self, info: ClientInfo) {
        if let Ok(mut client) = self.inner.client.lock() {
            *client = info;
        }
    }

    pub fn store(&self) -> Arc<dyn ResultsStore> {
        Arc::clone(&self.inner.store)
    }

    /// Aborts the active run. Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        let mut fired = false;
        self.inner.state.send_if_modified(|state| {
            if !state.phase.is_active() {
                return false;
            }
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
            state.phase = TestPhase::Idle;
            state.cancelled = true;
            fired = true;
            true
        });
        if fired {
            info!("measurement cancelled");
        }
        fired
    }

    /// Performs one full measurement.
    ///
    /// Returns `Ok(None)` when the run was cancelled; nothing is saved then.
    pub async fn start(
        &self,
        progress: ProgressReporter,
    ) -> Result<Option<MeasurementRecord>, EngineError> {
        if self.phase().is_active() {
            return Err(EngineError::AlreadyRunning);
        }

        let endpoints = self.inner.catalog.list_active().await?;
        let selected = self.selected_server();
        let endpoint = select_endpoint(&endpoints, selected.as_deref())
            .cloned()
            .ok_or(EngineError::NoEndpoints)?;
        if endpoint.download_targets.is_empty() {
            return Err(EngineError::NoDownloadTargets { id: endpoint.id });
        }

        let (run_id, cancel) = self.claim()?;
        let progress = progress.bind(cancel.clone());
        let rng = self.run_rng();
        info!("starting measurement against {} ({})", endpoint.display_name, endpoint.id);
        progress.milestone(ProgressEvent::Phase(TestPhase::Probing)).await;
        progress.live(ProgressEvent::Progress(0.0));

        match self.execute(run_id, &endpoint, &cancel, rng, &progress).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => Ok(None),
            Err(err) => {
                warn!("measurement failed: {}", err);
                if self.transition(run_id, TestPhase::Failed) {
                    progress.milestone(ProgressEvent::Phase(TestPhase::Failed)).await;
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        run_id: u64,
        endpoint: &EndpointDescriptor,
        cancel: &CancelToken,
        mut rng: StdRng,
        progress: &ProgressReporter,
    ) -> Result<Option<MeasurementRecord>, EngineError> {
        let config = self
            .inner
            .config
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();

        // Latency
        let latency = {
            let transport = Arc::clone(&self.inner.transport);
            let url = endpoint.latency_target.clone();
            let cancel = cancel.clone();
            let reporter = progress.clone();
            let timeout = config.probe_timeout;
            tokio::spawn(async move {
                PingTest::new(timeout)
                    .run(transport.as_ref(), &url, &cancel, &reporter)
                    .await
            })
            .await
            .map_err(|source| EngineError::PhaseTask {
                phase: "latency",
                source,
            })?
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }
        progress.milestone(ProgressEvent::LatencyComplete(latency)).await;

        // Download
        if !self.enter(run_id, TestPhase::Downloading, progress).await {
            return Ok(None);
        }
        let download = {
            let transport = Arc::clone(&self.inner.transport);
            let targets = endpoint.download_targets.clone();
            let cancel = cancel.clone();
            let reporter = progress.clone();
            let mut phase_rng = StdRng::seed_from_u64(rng.gen());
            let test = DownloadTest::new(config.download_duration)
                .with_partial_credit_bytes(config.partial_credit_bytes)
                .with_refresh(config.refresh);
            tokio::spawn(async move {
                test.run(transport.as_ref(), &targets, &mut phase_rng, &cancel, &reporter)
                    .await
            })
            .await
            .map_err(|source| EngineError::PhaseTask {
                phase: "download",
                source,
            })?
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }
        progress
            .milestone(ProgressEvent::DownloadComplete { bps: download.bps })
            .await;

        // Upload
        if !self.enter(run_id, TestPhase::Uploading, progress).await {
            return Ok(None);
        }
        let upload = {
            let transport = Arc::clone(&self.inner.transport);
            let target = endpoint.upload_target.clone();
            let cancel = cancel.clone();
            let reporter = progress.clone();
            let download_bps = download.bps;
            let mut phase_rng = StdRng::seed_from_u64(rng.gen());
            let test = UploadTest::new(config.upload_duration)
                .with_payload_bytes(config.upload_payload_bytes)
                .with_refresh(config.refresh);
            tokio::spawn(async move {
                test.run(
                    transport.as_ref(),
                    target.as_ref(),
                    download_bps,
                    &mut phase_rng,
                    &cancel,
                    &reporter,
                )
                .await
            })
            .await
            .map_err(|source| EngineError::PhaseTask {
                phase: "upload",
                source,
            })?
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }
        progress.milestone(ProgressEvent::UploadComplete(upload)).await;

        let client = self
            .inner
            .client
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        let record = MeasurementRecord {
            timestamp: Utc::now(),
            target_id: endpoint.id.clone(),
            target_label: endpoint.display_name.clone(),
            latency_ms: latency.avg_ms,
            latency_samples: latency.samples as u32,
            jitter_ms: latency.jitter_ms,
            download_bps: download.bps,
            upload,
            client_address: client.address,
            client_provider: client.provider,
            client_device_id: client.device_id,
        };

        if !self.transition(run_id, TestPhase::Complete) {
            return Ok(None);
        }
        progress.milestone(ProgressEvent::Phase(TestPhase::Complete)).await;
        progress.live(ProgressEvent::Progress(100.0));
        progress
            .milestone(ProgressEvent::Completed(record.clone()))
            .await;

        let upload_text = match record.upload {
            Some(rate) if rate.is_simulated() => {
                format!("{:.2} Mbps (simulated)", rate.bps() / 1_000_000.0)
            }
            Some(rate) => format!("{:.2} Mbps", rate.bps() / 1_000_000.0),
            None => "n/a".to_string(),
        };
        info!(
            "measurement complete: latency {:.0} ms ({} samples), download {:.2} Mbps, upload {}",
            record.latency_ms,
            record.latency_samples,
            record.download_bps / 1_000_000.0,
            upload_text
        );

        if let Err(err) = self.inner.store.save(&record).await {
            warn!("failed to save measurement: {}", err);
        }

        self.transition(run_id, TestPhase::Idle);
        progress.milestone(ProgressEvent::Phase(TestPhase::Idle)).await;
        Ok(Some(record))
    }

    /// Atomically moves from a resting phase to `Probing` under a new run id.
    fn claim(&self) -> Result<(u64, CancelToken), EngineError> {
        let run_id = self.inner.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancelToken::new();
        let claimed = self.inner.state.send_if_modified(|state| {
            if state.phase.is_active() {
                return false;
            }
            *state = RunState {
                phase: TestPhase::Probing,
                cancelled: false,
                run_id,
                cancel: Some(cancel.clone()),
            };
            true
        });
        if claimed {
            Ok((run_id, cancel))
        } else {
            Err(EngineError::AlreadyRunning)
        }
    }

    /// Applies `phase` if `run_id` still owns the engine.
    fn transition(&self, run_id: u64, phase: TestPhase) -> bool {
        self.inner.state.send_if_modified(|state| {
            if state.run_id != run_id || state.cancelled || !state.phase.is_active() {
                return false;
            }
            state.phase = phase;
            if !phase.is_active() {
                state.cancel = None;
            }
            true
        }) || self.settle(run_id, phase)
    }

    /// Complete → Idle happens after the run stopped being active.
    fn settle(&self, run_id: u64, phase: TestPhase) -> bool {
        if phase != TestPhase::Idle {
            return false;
        }
        self.inner.state.send_if_modified(|state| {
            if state.run_id != run_id || state.phase != TestPhase::Complete {
                return false;
            }
            state.phase = TestPhase::Idle;
            true
        })
    }

    async fn enter(&self, run_id: u64, phase: TestPhase, progress: &ProgressReporter) -> bool {
        if !self.transition(run_id, phase) {
            return false;
        }
        progress.milestone(ProgressEvent::Phase(phase)).await;
        progress.live(ProgressEvent::Progress(phase_progress(phase, 0.0)));
        true
    }

    fn run_rng(&self) -> StdRng {
        match self.inner.rng.lock() {
            Ok(mut shared) => StdRng::seed_from_u64(shared.gen()),
            Err(_) => StdRng::from_entropy(),
        }
    }
}
