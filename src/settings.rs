use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::EndpointDescriptor;
use crate::error::ConfigError;
use crate::speedtest::download::PARTIAL_CREDIT_BYTES;
use crate::speedtest::upload::PAYLOAD_BYTES;

const CONFIG_FILE: &str = "speedgauge.toml";
const APP_DIR: &str = "speedgauge";

pub const MIN_DURATION_SECS: u64 = 2;
pub const MAX_DURATION_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_duration_secs: u64,
    pub upload_duration_secs: u64,
    pub probe_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    pub upload_payload_bytes: usize,
    pub partial_credit_bytes: u64,
    /// Minimum gap between live readings sent to the display.
    pub refresh_ms: u64,
    /// Preferred server id.
    pub server: Option<String>,
    /// Fixed RNG seed, for reproducible target choice and simulations.
    pub seed: Option<u64>,
    pub history_limit: usize,
    pub data_dir: Option<PathBuf>,
    /// Look up public address and provider before measuring.
    pub client_lookup: bool,
    /// Extra servers, appended to the built-in ones.
    pub servers: Vec<EndpointDescriptor>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_duration_secs: 8,
            upload_duration_secs: 8,
            probe_timeout_ms: 2_000,
            connect_timeout_secs: 10,
            upload_payload_bytes: PAYLOAD_BYTES,
            partial_credit_bytes: PARTIAL_CREDIT_BYTES,
            refresh_ms: 100,
            server: None,
            seed: None,
            history_limit: 100,
            data_dir: None,
            client_lookup: true,
            servers: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from the first config file found in the
    /// working directory or the user config directory, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_file(path);
        }

        let candidates = [
            Some(PathBuf::from(CONFIG_FILE)),
            dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE)),
        ];
        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                return Self::load_file(&candidate);
            }
        }

        debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            source: err,
        })?;
        let settings: Settings = toml::from_str(&content).map_err(|err| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source: err,
        })?;
        settings.validate()?;
        debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_duration_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "download_duration_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.upload_duration_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "upload_duration_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "probe_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.upload_payload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "upload_payload_bytes",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(endpoint) = self.servers.iter().find(|s| s.download_targets.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "servers",
                reason: format!("server '{}' has no download_targets", endpoint.id),
            });
        }
        Ok(())
    }

    pub fn download_duration(&self) -> Duration {
        Duration::from_secs(self.download_duration_secs)
    }

    pub fn upload_duration(&self) -> Duration {
        Duration::from_secs(self.upload_duration_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(".speedgauge"))
        })
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir().join("history.json")
    }

    pub fn custom_servers_path(&self) -> PathBuf {
        self.data_dir().join("servers.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir().join("speedgauge.log")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    DownloadDuration,
    UploadDuration,
    Server,
}

impl SettingsField {
    pub fn next(self) -> Self {
        match self {
            SettingsField::DownloadDuration => SettingsField::UploadDuration,
            SettingsField::UploadDuration => SettingsField::Server,
            SettingsField::Server => SettingsField::DownloadDuration,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            SettingsField::DownloadDuration => SettingsField::Server,
            SettingsField::UploadDuration => SettingsField::DownloadDuration,
            SettingsField::Server => SettingsField::UploadDuration,
        }
    }
}
