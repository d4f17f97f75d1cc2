//! Persistence of completed measurements.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::StoreError;
use crate::speedtest::{MeasurementRecord, UploadRate};

#[async_trait]
pub trait ResultsStore: Send + Sync {
    async fn save(&self, record: &MeasurementRecord) -> Result<(), StoreError>;

    /// Up to `n` records, newest first.
    async fn recent(&self, n: usize) -> Result<Vec<MeasurementRecord>, StoreError>;

    /// Statistics over records from the last `window_days` days.
    async fn aggregate(&self, window_days: u32) -> Result<AggregateStats, StoreError>;
}

/// Averages over a set of records.
///
/// Measured and simulated uploads are kept apart, and runs whose latency
/// probes all failed do not drag the latency mean towards zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub count: usize,
    pub mean_download_bps: f64,
    pub max_download_bps: f64,
    pub mean_upload_bps: Option<f64>,
    pub measured_upload_count: usize,
    pub mean_simulated_upload_bps: Option<f64>,
    pub simulated_upload_count: usize,
    pub mean_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
}

impl AggregateStats {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a MeasurementRecord>,
    {
        let mut stats = AggregateStats::default();
        let mut download_sum = 0.0;
        let mut measured_sum = 0.0;
        let mut simulated_sum = 0.0;
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;

        for record in records {
            stats.count += 1;
            download_sum += record.download_bps;
            stats.max_download_bps = stats.max_download_bps.max(record.download_bps);

            match record.upload {
                Some(UploadRate::Measured(bps)) => {
                    measured_sum += bps;
                    stats.measured_upload_count += 1;
                }
                Some(UploadRate::Simulated(bps)) => {
                    simulated_sum += bps;
                    stats.simulated_upload_count += 1;
                }
                None => {}
            }

            if record.has_latency() {
                latency_sum += record.latency_ms;
                latency_count += 1;
                stats.min_latency_ms = Some(
                    stats
                        .min_latency_ms
                        .map_or(record.latency_ms, |min| min.min(record.latency_ms)),
                );
            }
        }

        if stats.count > 0 {
            stats.mean_download_bps = download_sum / stats.count as f64;
        }
        if stats.measured_upload_count > 0 {
            stats.mean_upload_bps = Some(measured_sum / stats.measured_upload_count as f64);
        }
        if stats.simulated_upload_count > 0 {
            stats.mean_simulated_upload_bps =
                Some(simulated_sum / stats.simulated_upload_count as f64);
        }
        if latency_count > 0 {
            stats.mean_latency_ms = Some(latency_sum / latency_count as f64);
        }
        stats
    }
}

fn within_window(record: &MeasurementRecord, window_days: u32) -> bool {
    record.timestamp >= Utc::now() - ChronoDuration::days(i64::from(window_days))
}

/// Volatile store for embedding and tests.
pub struct MemoryStore {
    records: Mutex<Vec<MeasurementRecord>>,
    limit: usize,
}

impl MemoryStore {
    pub fn new(limit: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            limit,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<MeasurementRecord>>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Unavailable)
    }
}

#[async_trait]
impl ResultsStore for MemoryStore {
    async fn save(&self, record: &MeasurementRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        records.insert(0, record.clone());
        records.truncate(self.limit);
        Ok(())
    }

    async fn recent(&self, n: usize) -> Result<Vec<MeasurementRecord>, StoreError> {
        Ok(self.lock()?.iter().take(n).cloned().collect())
    }

    async fn aggregate(&self, window_days: u32) -> Result<AggregateStats, StoreError> {
        let records = self.lock()?;
        Ok(AggregateStats::from_records(
            records.iter().filter(|r| within_window(r, window_days)),
        ))
    }
}

/// History kept as a JSON array on disk, newest first, capped at `limit`.
pub struct JsonFileStore {
    path: PathBuf,
    limit: usize,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_all(&[]).await
    }

    async fn load(&self) -> Result<Vec<MeasurementRecord>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("history file {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|err| StoreError::Decode {
            path: self.path.clone(),
            source: err,
        })
    }

    async fn write_all(&self, records: &[MeasurementRecord]) -> Result<(), StoreError> {
        let json =
            serde_json::to_string_pretty(records).map_err(|err| StoreError::Encode { source: err })?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::Write {
                    path: self.path.clone(),
                    source: err,
                })?;
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|err| StoreError::Write {
                path: self.path.clone(),
                source: err,
            })
    }
}

#[async_trait]
impl ResultsStore for JsonFileStore {
    async fn save(&self, record: &MeasurementRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        records.insert(0, record.clone());
        records.truncate(self.limit);
        self.write_all(&records).await?;
        debug!("saved result to {}", self.path.display());
        Ok(())
    }

    async fn recent(&self, n: usize) -> Result<Vec<MeasurementRecord>, StoreError> {
        let mut records = self.load().await?;
        records.truncate(n);
        Ok(records)
    }

    async fn aggregate(&self, window_days: u32) -> Result<AggregateStats, StoreError> {
        let records = self.load().await?;
        Ok(AggregateStats::from_records(
            records.iter().filter(|r| within_window(r, window_days)),
        ))
    }
}
