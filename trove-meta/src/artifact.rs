//! Plugin artifact staging
//!
//! Artifacts are fetched from a locator (`https://...`, `file://...` or a
//! plain path), written to the staging directory as a `.partial` file,
//! verified against their declared SHA-256 and only then renamed into
//! place. Staged artifacts are content-addressed by checksum and never
//! modified afterwards.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extension of verified staged artifacts
const STAGED_EXTENSION: &str = "plugin";

/// Fetches raw artifact bytes from a locator
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>>;
}

/// Default source: HTTP(S) via reqwest, anything else from the filesystem
pub struct ArtifactFetcher {
    http: reqwest::Client,
}

impl ArtifactFetcher {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("trove-meta/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::Artifact(format!("HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

pub(crate) fn is_http(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

pub(crate) fn local_path(locator: &str) -> &Path {
    Path::new(locator.strip_prefix("file://").unwrap_or(locator))
}

#[async_trait]
impl ArtifactSource for ArtifactFetcher {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        if !is_http(locator) {
            let path = local_path(locator);
            debug!(path = %path.display(), "Reading artifact from disk");
            return tokio::fs::read(path)
                .await
                .map_err(|e| EngineError::Artifact(format!("{}: {}", path.display(), e)));
        }

        debug!(url = %locator, "Downloading artifact");
        let response = self
            .http
            .get(locator)
            .send()
            .await
            .map_err(|e| EngineError::Artifact(format!("{}: {}", locator, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Artifact(format!(
                "{}: HTTP {}",
                locator,
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::Artifact(format!("{}: {}", locator, e)))?;
        Ok(bytes.to_vec())
    }
}

/// Verified artifact in the staging directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub path: PathBuf,
    pub checksum_sha256: String,
    pub size: u64,
}

/// SHA-256 of a file, hex encoded
///
/// Hashing runs on the blocking pool in 1MB chunks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::fs::File;
        use std::io::Read;

        let mut file = File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| EngineError::Artifact(format!("hash task failed: {}", e)))?
}

/// Normalise a declared checksum for comparison
pub fn normalize_checksum(checksum: &str) -> String {
    checksum.trim().to_ascii_lowercase()
}

/// Stages artifacts into a directory
pub struct ArtifactStager {
    dir: PathBuf,
    source: Arc<dyn ArtifactSource>,
}

impl ArtifactStager {
    pub fn new(dir: impl Into<PathBuf>, source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            dir: dir.into(),
            source,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch, verify and stage an artifact
    ///
    /// Fails with `ChecksumMismatch` (leaving nothing behind) when the
    /// content does not hash to `expected_sha256`.
    pub async fn stage(&self, locator: &str, expected_sha256: &str) -> Result<StagedArtifact> {
        let expected = normalize_checksum(expected_sha256);
        let bytes = self.source.fetch(locator).await?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let partial = self.dir.join(format!("{}.partial", Uuid::new_v4()));
        tokio::fs::write(&partial, &bytes).await?;

        let actual = match sha256_file(&partial).await {
            Ok(actual) => actual,
            Err(e) => {
                remove_quietly(&partial).await;
                return Err(e);
            }
        };

        if actual != expected {
            remove_quietly(&partial).await;
            warn!(
                locator = %locator,
                expected = %expected,
                actual = %actual,
                "Artifact checksum mismatch"
            );
            return Err(EngineError::ChecksumMismatch { expected, actual });
        }

        let path = self.dir.join(format!("{}.{}", actual, STAGED_EXTENSION));
        tokio::fs::rename(&partial, &path).await?;

        info!(
            locator = %locator,
            path = %path.display(),
            size = bytes.len(),
            "Artifact staged"
        );

        Ok(StagedArtifact {
            path,
            checksum_sha256: actual,
            size: bytes.len() as u64,
        })
    }

    /// Re-verify a previously staged artifact (used on restore)
    pub async fn verify(&self, path: &Path, expected_sha256: &str) -> Result<StagedArtifact> {
        let expected = normalize_checksum(expected_sha256);
        let actual = sha256_file(path).await?;
        if actual != expected {
            return Err(EngineError::ChecksumMismatch { expected, actual });
        }
        let size = tokio::fs::metadata(path).await?.len();
        Ok(StagedArtifact {
            path: path.to_path_buf(),
            checksum_sha256: actual,
            size,
        })
    }

    /// Delete a staged artifact; missing files are not an error
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "Could not remove partial artifact");
    }
}
