use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop a measurement run from starting or finishing.
///
/// Network flakiness during a run is never reported through this type; the
/// transfer runners absorb it and degrade to partial or simulated numbers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("A measurement run is already in progress.")]
    AlreadyRunning,
    #[error("No active measurement endpoints are available.")]
    NoEndpoints,
    #[error("Endpoint '{id}' has no download targets.")]
    NoDownloadTargets { id: String },
    #[error("Server catalog unavailable: {source}")]
    Catalog {
        #[from]
        source: CatalogError,
    },
    #[error("{phase} phase task did not finish: {source}")]
    PhaseTask {
        phase: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Failure of a single HTTP exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed: {source}")]
    Request {
        #[from]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}.")]
    Status { status: u16 },
    #[error("Request timed out after {millis} ms.")]
    Timeout { millis: u64 },
    #[error("Transfer interrupted: {reason}")]
    Interrupted { reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("File '{path}' is corrupt: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode data: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("Results store is unavailable.")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Server catalog could not be loaded: {reason}")]
    Unavailable { reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid setting '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
