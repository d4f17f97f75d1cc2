use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use url::Url;

use super::transport::{ByteStream, Transport};
use super::{MeasurementRecord, UploadRate};
use crate::error::{StoreError, TransportError};
use crate::store::{AggregateStats, MemoryStore, ResultsStore};

pub(crate) fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

pub(crate) fn record(
    download_bps: f64,
    upload: Option<UploadRate>,
    latency_ms: f64,
    latency_samples: u32,
) -> MeasurementRecord {
    MeasurementRecord {
        timestamp: Utc::now(),
        target_id: "test".to_string(),
        target_label: "Test server".to_string(),
        latency_ms,
        latency_samples,
        jitter_ms: 0.0,
        download_bps,
        upload,
        client_address: None,
        client_provider: None,
        client_device_id: None,
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ProbeScript {
    Delay(Duration),
    Fail,
    /// Per-probe delay; `None` fails that probe.
    Sequence(Vec<Option<Duration>>),
    Panic,
}

#[derive(Debug, Clone)]
pub(crate) enum StreamStep {
    Chunk { after: Duration, bytes: usize },
    Fail { after: Duration },
}

#[derive(Debug, Clone)]
pub(crate) enum PostScript {
    Delay(Duration),
    FailAfter { successes: usize, delay: Duration },
}

/// Transport that replays canned timings on tokio's clock.
pub(crate) struct ScriptedTransport {
    probes: ProbeScript,
    download: Vec<StreamStep>,
    download_open_failure: Option<u16>,
    posts: PostScript,
    probe_calls: AtomicUsize,
    post_calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            probes: ProbeScript::Delay(Duration::from_millis(20)),
            download: Vec::new(),
            download_open_failure: None,
            posts: PostScript::Delay(Duration::from_millis(100)),
            probe_calls: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_probes(mut self, probes: ProbeScript) -> Self {
        self.probes = probes;
        self
    }

    pub(crate) fn with_download(mut self, steps: Vec<StreamStep>) -> Self {
        self.download = steps;
        self
    }

    pub(crate) fn with_download_open_failure(mut self, status: u16) -> Self {
        self.download_open_failure = Some(status);
        self
    }

    pub(crate) fn with_posts(mut self, posts: PostScript) -> Self {
        self.posts = posts;
        self
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn post_count(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requested_urls(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    fn note(&self, url: &Url) {
        self.requested.lock().unwrap().push(url.to_string());
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn probe(&self, url: &Url) -> Result<(), TransportError> {
        self.note(url);
        let n = self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = match &self.probes {
            ProbeScript::Delay(delay) => Some(*delay),
            ProbeScript::Fail => None,
            ProbeScript::Sequence(delays) => delays.get(n).copied().flatten(),
            ProbeScript::Panic => panic!("scripted probe panic"),
        };
        match delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(TransportError::Interrupted {
                reason: "scripted probe failure".to_string(),
            }),
        }
    }

    async fn open_download(&self, url: &Url) -> Result<ByteStream, TransportError> {
        self.note(url);
        if let Some(status) = self.download_open_failure {
            return Err(TransportError::Status { status });
        }

        let steps = self.download.clone().into_iter();
        Ok(futures::stream::unfold(steps, |mut steps| async move {
            let item = match steps.next()? {
                StreamStep::Chunk { after, bytes } => {
                    tokio::time::sleep(after).await;
                    Ok(Bytes::from(vec![0u8; bytes]))
                }
                StreamStep::Fail { after } => {
                    tokio::time::sleep(after).await;
                    Err(TransportError::Interrupted {
                        reason: "scripted stream failure".to_string(),
                    })
                }
            };
            Some((item, steps))
        })
        .boxed())
    }

    async fn upload(&self, url: &Url, _body: Bytes) -> Result<(), TransportError> {
        self.note(url);
        let n = self.post_calls.fetch_add(1, Ordering::SeqCst);
        match &self.posts {
            PostScript::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            PostScript::FailAfter { successes, delay } => {
                tokio::time::sleep(*delay).await;
                if n >= *successes {
                    Err(TransportError::Status { status: 502 })
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Store that counts saves and can be told to fail them.
pub(crate) struct RecordingStore {
    inner: MemoryStore,
    saves: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(100),
            saves: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn failing() -> Self {
        let store = Self::new();
        store.fail.store(true, Ordering::SeqCst);
        store
    }

    pub(crate) fn save_calls(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultsStore for RecordingStore {
    async fn save(&self, record: &MeasurementRecord) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.inner.save(record).await
    }

    async fn recent(&self, n: usize) -> Result<Vec<MeasurementRecord>, StoreError> {
        self.inner.recent(n).await
    }

    async fn aggregate(&self, window_days: u32) -> Result<AggregateStats, StoreError> {
        self.inner.aggregate(window_days).await
    }
}
