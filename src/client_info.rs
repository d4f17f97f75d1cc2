//! Who is measuring: installation id plus best-effort public address lookup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOOKUP_URL: &str = "https://ipwhois.app/json/";
const DEVICE_ID_FILE: &str = "device_id";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub address: Option<String>,
    pub provider: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhoisResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    org: Option<String>,
}

/// Reads the installation id from `data_dir`, creating one on first use.
pub fn load_or_create_device_id(data_dir: &Path) -> Option<String> {
    let path = data_dir.join(DEVICE_ID_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if Uuid::parse_str(existing).is_ok() {
            return Some(existing.to_string());
        }
        warn!("ignoring malformed device id in {}", path.display());
    }

    let id = Uuid::new_v4().to_string();
    if let Err(err) = std::fs::create_dir_all(data_dir).and_then(|_| std::fs::write(&path, &id)) {
        warn!("could not persist device id to {}: {}", path.display(), err);
    }
    Some(id)
}

/// Extracts `(address, provider)` from a lookup response body.
fn parse_whois(body: &str) -> (Option<String>, Option<String>) {
    match serde_json::from_str::<WhoisResponse>(body) {
        Ok(resp) if resp.success != Some(false) => {
            let provider = resp.isp.or(resp.org).filter(|p| !p.is_empty());
            (resp.ip.filter(|ip| !ip.is_empty()), provider)
        }
        Ok(_) => (None, None),
        Err(err) => {
            debug!("unreadable address lookup response: {}", err);
            (None, None)
        }
    }
}

/// Queries `lookup_url` for the public address and provider. Failures yield `None`s.
pub async fn lookup_network(lookup_url: &str, timeout: Duration) -> (Option<String>, Option<String>) {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            warn!("address lookup client unavailable: {}", err);
            return (None, None);
        }
    };

    let body = match client.get(lookup_url).send().await {
        Ok(resp) => resp.text().await,
        Err(err) => Err(err),
    };
    match body {
        Ok(body) => parse_whois(&body),
        Err(err) => {
            warn!("address lookup failed: {}", err);
            (None, None)
        }
    }
}

pub async fn detect(data_dir: &Path, lookup_url: Option<&str>) -> ClientInfo {
    let device_id = load_or_create_device_id(data_dir);
    let (address, provider) = match lookup_url {
        Some(url) => lookup_network(url, Duration::from_secs(5)).await,
        None => (None, None),
    };
    ClientInfo {
        address,
        provider,
        device_id,
    }
}
