//! Network latency and throughput measurement over plain HTTP.
//!
//! The engine lives in [`speedtest`]; endpoints come from a [`catalog`] and
//! finished measurements go to a [`store`].

pub mod catalog;
pub mod client_info;
pub mod error;
pub mod logger;
pub mod settings;
pub mod speedtest;
pub mod store;

pub use catalog::{EndpointDescriptor, ServerCatalog, StaticCatalog};
pub use error::{CatalogError, ConfigError, EngineError, StoreError, TransportError};
pub use settings::Settings;
pub use speedtest::orchestrator::{EngineConfig, Orchestrator, RunState};
pub use speedtest::{MeasurementRecord, ProgressEvent, ProgressReporter, TestPhase, UploadRate};
pub use store::{AggregateStats, JsonFileStore, MemoryStore, ResultsStore};
