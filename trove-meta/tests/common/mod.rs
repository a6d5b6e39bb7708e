//! Shared fixtures for trove-meta integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use trove_common::config::EngineConfig;
use trove_meta::lifecycle::StaticPluginLoader;
use trove_meta::manifest::{ReleaseInfo, StaticUpdateSource, UpdateManifest};
use trove_meta::settings::ProviderSettings;
use trove_meta::store::{MemoryStateStore, StateStore};
use trove_meta::{
    Capability, MetadataEngine, MetadataProvider, ProviderCall, ProviderDescriptor, ProviderError,
    ProviderPayload, Version,
};

/// Scripted reply for one provider call
#[derive(Debug, Clone)]
pub enum Reply {
    Payload(ProviderPayload),
    Fail(ProviderError),
    /// Sleep, then answer with the inner reply
    Delayed(Duration, Box<Reply>),
}

/// Provider whose answers are set by the test
pub struct MockProvider {
    descriptor: ProviderDescriptor,
    default_reply: Mutex<Reply>,
    script: Mutex<VecDeque<Reply>>,
    probe_ok: bool,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self {
            descriptor,
            default_reply: Mutex::new(Reply::Payload(ProviderPayload::new())),
            script: Mutex::new(VecDeque::new()),
            probe_ok: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Provider serving `fields` of `media_type` at `priority`
    pub fn serving(name: &str, version: Version, media_type: &str, fields: &[&str], priority: i32) -> Self {
        Self::new(
            ProviderDescriptor::new(name, version)
                .with_capability(Capability::new(media_type, fields.iter().copied(), priority)),
        )
    }

    pub fn replying(self, reply: Reply) -> Self {
        self.set_reply(reply);
        self
    }

    pub fn with_payload(self, payload: ProviderPayload) -> Self {
        self.replying(Reply::Payload(payload))
    }

    pub fn with_failing_probe(mut self) -> Self {
        self.probe_ok = false;
        self
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.default_reply.lock().unwrap() = reply;
    }

    /// Queue a one-shot reply used before the default
    pub fn push_reply(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Reply {
        if let Some(reply) = self.script.lock().unwrap().pop_front() {
            return reply;
        }
        self.default_reply.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataProvider for MockProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, _call: &ProviderCall) -> Result<ProviderPayload, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut reply = self.next_reply();
        loop {
            match reply {
                Reply::Payload(payload) => return Ok(payload),
                Reply::Fail(error) => return Err(error),
                Reply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }

    async fn probe(&self, _settings: &ProviderSettings) -> Result<(), ProviderError> {
        if self.probe_ok {
            Ok(())
        } else {
            Err(ProviderError::Network("probe endpoint unreachable".to_string()))
        }
    }
}

pub fn payload(fields: &[(&str, Value)]) -> ProviderPayload {
    fields
        .iter()
        .fold(ProviderPayload::new(), |p, (k, v)| p.with(*k, v.clone()))
}

pub fn deadline(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

/// Engine config with staging in `dir` and fast breaker settings
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        failure_threshold: 2,
        cooldown_secs: 30,
        staging_dir: Some(dir.join("staging")),
        ..EngineConfig::default()
    }
}

/// Build an engine with builtin providers, all enabled
pub async fn engine_with(config: EngineConfig, providers: &[Arc<MockProvider>]) -> MetadataEngine {
    let mut builder = MetadataEngine::builder(config).store(Arc::new(MemoryStateStore::new()));
    for provider in providers {
        builder = builder.builtin(Arc::clone(provider) as Arc<dyn MetadataProvider>);
    }
    let engine = builder.build().await.unwrap();
    for provider in providers {
        engine.enable(&provider.descriptor().name).await.unwrap();
    }
    engine
}

/// Plugin artifacts, loader and update source backed by a temp directory
pub struct PluginHarness {
    pub dir: tempfile::TempDir,
    pub loader: Arc<StaticPluginLoader>,
    pub updates: Arc<StaticUpdateSource>,
    pub store: Arc<MemoryStateStore>,
}

impl PluginHarness {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            loader: Arc::new(StaticPluginLoader::new()),
            updates: Arc::new(StaticUpdateSource::new()),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    pub fn config(&self) -> EngineConfig {
        test_config(self.dir.path())
    }

    /// Register an implementation and write its artifact; returns (path, sha256)
    pub fn publish_artifact<F>(&self, name: &str, version: Version, factory: F) -> (PathBuf, String)
    where
        F: Fn() -> Arc<dyn MetadataProvider> + Send + Sync + 'static,
    {
        self.loader.register(name, version, factory);

        let artifacts = self.dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        let path = artifacts.join(format!("{}-{}.plugin", name, version));
        let bytes = StaticPluginLoader::artifact_bytes(name, version);
        std::fs::write(&path, &bytes).unwrap();

        (path, format!("{:x}", Sha256::digest(&bytes)))
    }

    /// Publish an artifact and make it the `stable` release in the manifest
    pub fn publish_release<F>(&self, name: &str, version: Version, min_engine: Option<Version>, factory: F)
    where
        F: Fn() -> Arc<dyn MetadataProvider> + Send + Sync + 'static,
    {
        let (path, checksum) = self.publish_artifact(name, version, factory);
        self.publish_manifest(
            name,
            ReleaseInfo {
                version,
                download_url: path.display().to_string(),
                checksum_sha256: checksum,
                changelog: None,
                min_engine_version: min_engine,
            },
        );
    }

    /// Make `release` the `stable` release in the manifest for `name`
    pub fn publish_manifest(&self, name: &str, release: ReleaseInfo) {
        let mut manifest = UpdateManifest {
            name: name.to_string(),
            versions: Default::default(),
        };
        manifest.versions.insert("stable".to_string(), release);
        self.updates.publish(manifest);
    }

    pub async fn engine(&self) -> MetadataEngine {
        self.engine_with_config(self.config()).await
    }

    pub async fn engine_with_config(&self, config: EngineConfig) -> MetadataEngine {
        MetadataEngine::builder(config)
            .store(Arc::clone(&self.store) as Arc<dyn StateStore>)
            .loader(self.loader.clone())
            .update_source(self.updates.clone())
            .build()
            .await
            .unwrap()
    }
}
