//! Measurement endpoints and where they come from.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{CatalogError, StoreError};

const CUSTOM_PREFIX: &str = "custom_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub download_targets: Vec<Url>,
    #[serde(default)]
    pub upload_target: Option<Url>,
    pub latency_target: Url,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl EndpointDescriptor {
    /// A user-supplied server: one URL for both download and latency, no upload.
    pub fn custom(name: &str, url: Url) -> Self {
        Self {
            id: format!("{}{}", CUSTOM_PREFIX, Utc::now().timestamp_millis()),
            display_name: name.to_string(),
            download_targets: vec![url.clone()],
            upload_target: None,
            latency_target: url,
            is_default: false,
            is_active: true,
        }
    }

    pub fn is_custom(&self) -> bool {
        self.id.starts_with(CUSTOM_PREFIX)
    }
}

/// Source of candidate endpoints.
#[async_trait]
pub trait ServerCatalog: Send + Sync {
    async fn list_active(&self) -> Result<Vec<EndpointDescriptor>, CatalogError>;
}

/// In-process catalog backed by configuration.
///
/// Custom servers can be kept in a JSON file so they outlive the process.
pub struct StaticCatalog {
    endpoints: RwLock<Vec<EndpointDescriptor>>,
    custom_file: Option<PathBuf>,
}

impl StaticCatalog {
    pub fn new(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
            custom_file: None,
        }
    }

    /// Loads custom servers saved at `path` and keeps later changes there.
    pub fn with_custom_file(mut self, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        for endpoint in load_custom(&path)? {
            self.add(endpoint);
        }
        self.custom_file = Some(path);
        Ok(self)
    }

    /// Built-in servers followed by `extra`.
    pub fn with_builtin(extra: Vec<EndpointDescriptor>) -> Self {
        let mut endpoints = builtin_endpoints();
        endpoints.extend(extra);
        Self::new(endpoints)
    }

    pub fn add(&self, endpoint: EndpointDescriptor) {
        debug!("adding endpoint {} ({})", endpoint.id, endpoint.display_name);
        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints.retain(|e| e.id != endpoint.id);
            endpoints.push(endpoint);
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.endpoints.write() {
            Ok(mut endpoints) => {
                let before = endpoints.len();
                endpoints.retain(|e| e.id != id);
                endpoints.len() != before
            }
            Err(_) => false,
        }
    }

    /// Adds a single-URL server and saves it. A URL that is already
    /// registered returns the existing entry.
    pub fn add_custom(&self, name: &str, url: Url) -> Result<EndpointDescriptor, StoreError> {
        let existing = self.custom_endpoints().into_iter().find(|e| e.latency_target == url);
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let mut endpoint = EndpointDescriptor::custom(name, url);
        let base = endpoint.id.clone();
        let mut n = 1;
        while self.contains(&endpoint.id) {
            endpoint.id = format!("{}_{}", base, n);
            n += 1;
        }

        self.add(endpoint.clone());
        self.persist_custom()?;
        Ok(endpoint)
    }

    /// Forgets a custom server. Built-in and configured servers are left alone.
    pub fn remove_custom(&self, id: &str) -> Result<bool, StoreError> {
        if !id.starts_with(CUSTOM_PREFIX) || !self.remove(id) {
            return Ok(false);
        }
        self.persist_custom()?;
        Ok(true)
    }

    fn contains(&self, id: &str) -> bool {
        self.endpoints
            .read()
            .map(|endpoints| endpoints.iter().any(|e| e.id == id))
            .unwrap_or(false)
    }

    fn custom_endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints
            .read()
            .map(|endpoints| endpoints.iter().filter(|e| e.is_custom()).cloned().collect())
            .unwrap_or_default()
    }

    fn persist_custom(&self) -> Result<(), StoreError> {
        let Some(path) = &self.custom_file else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.custom_endpoints())
            .map_err(|err| StoreError::Encode { source: err })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Write {
                path: path.clone(),
                source: err,
            })?;
        }
        std::fs::write(path, json).map_err(|err| StoreError::Write {
            path: path.clone(),
            source: err,
        })?;
        debug!("saved custom servers to {}", path.display());
        Ok(())
    }
}

fn load_custom(path: &Path) -> Result<Vec<EndpointDescriptor>, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let endpoints: Vec<EndpointDescriptor> =
        serde_json::from_str(&content).map_err(|err| StoreError::Decode {
            path: path.to_path_buf(),
            source: err,
        })?;
    Ok(endpoints.into_iter().filter(|e| e.is_custom()).collect())
}

#[async_trait]
impl ServerCatalog for StaticCatalog {
    async fn list_active(&self) -> Result<Vec<EndpointDescriptor>, CatalogError> {
        let endpoints = self.endpoints.read().map_err(|_| CatalogError::Unavailable {
            reason: "catalog lock poisoned".to_string(),
        })?;
        let mut active: Vec<EndpointDescriptor> =
            endpoints.iter().filter(|e| e.is_active).cloned().collect();
        // Defaults first, otherwise keep configured order.
        active.sort_by_key(|e| !e.is_default);
        Ok(active)
    }
}

/// Picks `preferred` when it is among `endpoints`, else the first default, else the first.
pub fn select_endpoint<'a>(
    endpoints: &'a [EndpointDescriptor],
    preferred: Option<&str>,
) -> Option<&'a EndpointDescriptor> {
    preferred
        .and_then(|id| endpoints.iter().find(|e| e.id == id))
        .or_else(|| endpoints.iter().find(|e| e.is_default))
        .or_else(|| endpoints.first())
}

pub fn builtin_endpoints() -> Vec<EndpointDescriptor> {
    [
        builtin(
            "cloudflare",
            "Cloudflare",
            &[
                "https://speed.cloudflare.com/__down?bytes=25000000",
                "https://speed.cloudflare.com/__down?bytes=50000000",
            ],
            Some("https://speed.cloudflare.com/__up"),
            "https://speed.cloudflare.com/cdn-cgi/trace",
            true,
        ),
        builtin(
            "ovh",
            "OVH Telecom",
            &[
                "https://proof.ovh.net/files/10Mb.dat",
                "https://proof.ovh.net/files/100Mb.dat",
            ],
            None,
            "https://proof.ovh.net/files/1Mb.dat",
            false,
        ),
        builtin(
            "httpbin",
            "HTTPBin (debug)",
            &["https://httpbin.org/stream-bytes/5000000"],
            Some("https://httpbin.org/post"),
            "https://httpbin.org/get",
            false,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn builtin(
    id: &str,
    name: &str,
    downloads: &[&str],
    upload: Option<&str>,
    latency: &str,
    is_default: bool,
) -> Option<EndpointDescriptor> {
    let download_targets = downloads
        .iter()
        .map(|u| Url::parse(u))
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let upload_target = match upload {
        Some(u) => Some(Url::parse(u).ok()?),
        None => None,
    };
    Some(EndpointDescriptor {
        id: id.to_string(),
        display_name: name.to_string(),
        download_targets,
        upload_target,
        latency_target: Url::parse(latency).ok()?,
        is_default,
        is_active: true,
    })
}
