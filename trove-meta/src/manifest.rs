//! Update manifests
//!
//! A manifest lists the current release of one provider per update
//! channel:
//!
//! ```json
//! {
//!   "name": "tmdb",
//!   "versions": {
//!     "stable": {
//!       "version": "1.3.0",
//!       "downloadUrl": "https://plugins.example/tmdb-1.3.0.plugin",
//!       "checksumSha256": "9f2c...",
//!       "changelog": "Adds backdrop_url",
//!       "minEngineVersion": "0.1.0"
//!     }
//!   }
//! }
//! ```

use crate::artifact::{is_http, local_path};
use crate::error::{EngineError, Result};
use crate::types::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// One release on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub version: Version,
    #[serde(alias = "download_url")]
    pub download_url: String,
    #[serde(alias = "checksum_sha256")]
    pub checksum_sha256: String,
    #[serde(default)]
    pub changelog: Option<String>,
    #[serde(default, alias = "min_engine_version")]
    pub min_engine_version: Option<Version>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub name: String,
    /// Channel name → release
    pub versions: BTreeMap<String, ReleaseInfo>,
}

impl UpdateManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| EngineError::Manifest(e.to_string()))
    }

    pub fn release(&self, channel: &str) -> Result<&ReleaseInfo> {
        self.versions.get(channel).ok_or_else(|| {
            EngineError::Manifest(format!("{} has no '{}' channel", self.name, channel))
        })
    }
}

/// Where update manifests come from
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn manifest(&self, provider: &str) -> Result<UpdateManifest>;
}

/// Fetches `<base_url>/<provider>.json`
pub struct HttpUpdateSource {
    base_url: String,
    http: reqwest::Client,
}

impl HttpUpdateSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("trove-meta/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Manifest(format!("HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn url_for(&self, provider: &str) -> String {
        format!("{}/{}.json", self.base_url, provider)
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn manifest(&self, provider: &str) -> Result<UpdateManifest> {
        fetch_remote(&self.http, &self.url_for(provider)).await
    }
}

/// In-memory manifests, keyed by provider name
#[derive(Debug, Default)]
pub struct StaticUpdateSource {
    manifests: std::sync::RwLock<BTreeMap<String, UpdateManifest>>,
}

impl StaticUpdateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, manifest: UpdateManifest) {
        self.manifests
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(manifest.name.clone(), manifest);
    }
}

#[async_trait]
impl UpdateSource for StaticUpdateSource {
    async fn manifest(&self, provider: &str) -> Result<UpdateManifest> {
        self.manifests
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(provider)
            .cloned()
            .ok_or_else(|| EngineError::Manifest(format!("no manifest published for {}", provider)))
    }
}

async fn fetch_remote(http: &reqwest::Client, url: &str) -> Result<UpdateManifest> {
    debug!(url = %url, "Fetching update manifest");
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| EngineError::Manifest(format!("{}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Manifest(format!("{}: HTTP {}", url, status.as_u16())));
    }

    response
        .json::<UpdateManifest>()
        .await
        .map_err(|e| EngineError::Manifest(format!("{}: {}", url, e)))
}

/// Load a manifest from a URL or a local path
pub async fn load_manifest(locator: &str) -> Result<UpdateManifest> {
    if is_http(locator) {
        let http = reqwest::Client::new();
        return fetch_remote(&http, locator).await;
    }

    let path = local_path(locator);
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Manifest(format!("{}: {}", path.display(), e)))?;
    UpdateManifest::from_json(&text)
}
