//! Metadata engine facade
//!
//! Wires registry, priority store, cache, scheduler, merger and lifecycle
//! manager together and exposes the Resolution API and the Admin API.
//!
//! # Example
//! ```rust,ignore
//! let engine = MetadataEngine::builder(config.engine.clone())
//!     .builtin(Arc::new(Tmdb::new()))
//!     .build()
//!     .await?;
//! engine.enable("tmdb").await?;
//!
//! let deadline = Instant::now() + Duration::from_secs(5);
//! let resolution = engine.resolve("movie", "tt0078748", ["title", "poster_url"], deadline).await;
//! ```

use crate::artifact::{ArtifactFetcher, ArtifactSource, ArtifactStager};
use crate::cache::ResponseCache;
use crate::error::{EngineError, Result};
use crate::health::{BreakerConfig, HealthSnapshot};
use crate::lifecycle::{
    LifecycleConfig, PluginLifecycleManager, PluginLoader, RestoreReport, StaticPluginLoader,
    UpdateOutcome,
};
use crate::manifest::{StaticUpdateSource, UpdateSource};
use crate::merger::{MergerConfig, Resolution, ResolutionRequest, ResultMerger};
use crate::planner::{Candidate, FieldPlanner};
use crate::priority::{FallbackBehavior, PriorityEntry, PriorityStore};
use crate::provider::MetadataProvider;
use crate::registry::{LifecycleState, PluginVersionRecord, ProviderRegistry};
use crate::scheduler::ExecutionScheduler;
use crate::settings::{ProviderSettings, SettingsSchema};
use crate::store::{MemoryStateStore, StateStore};
use crate::types::Version;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::info;
#[cfg(not(feature = "sqlx"))]
use tracing::warn;
use trove_common::config::EngineConfig;
use trove_common::events::{EngineEvent, EventBus};

/// Admin view of one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub active_version: Version,
    pub enabled: bool,
    pub state: LifecycleState,
    pub rate_limit_per_minute: u32,
    pub versions: Vec<PluginVersionRecord>,
    pub health: HealthSnapshot,
}

pub struct MetadataEngineBuilder {
    config: EngineConfig,
    events: Option<EventBus>,
    store: Option<Arc<dyn StateStore>>,
    loader: Option<Arc<dyn PluginLoader>>,
    updates: Option<Arc<dyn UpdateSource>>,
    artifacts: Option<Arc<dyn ArtifactSource>>,
    engine_version: Option<Version>,
    builtins: Vec<Arc<dyn MetadataProvider>>,
}

impl MetadataEngineBuilder {
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn update_source(mut self, updates: Arc<dyn UpdateSource>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn artifact_source(mut self, artifacts: Arc<dyn ArtifactSource>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Override the version checked against plugin `min_engine_version`
    pub fn engine_version(mut self, version: Version) -> Self {
        self.engine_version = Some(version);
        self
    }

    /// Provider compiled into the host, installed after state restore
    pub fn builtin(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.builtins.push(provider);
        self
    }

    async fn open_store(config: &EngineConfig) -> Result<Arc<dyn StateStore>> {
        match &config.database_path {
            #[cfg(feature = "sqlx")]
            Some(path) => Ok(Arc::new(crate::store::SqliteStateStore::open(path).await?)),
            #[cfg(not(feature = "sqlx"))]
            Some(path) => {
                warn!(path = %path.display(), "Built without sqlx, engine state will not persist");
                Ok(Arc::new(MemoryStateStore::new()))
            }
            None => Ok(Arc::new(MemoryStateStore::new())),
        }
    }

    /// Assemble the engine, restore persisted state, install builtins
    pub async fn build(self) -> Result<MetadataEngine> {
        let config = self.config;
        config.validate()?;

        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(config.event_capacity));
        let store = match self.store {
            Some(store) => store,
            None => Self::open_store(&config).await?,
        };
        let artifacts: Arc<dyn ArtifactSource> = match self.artifacts {
            Some(source) => source,
            None => Arc::new(ArtifactFetcher::new()?),
        };
        let loader: Arc<dyn PluginLoader> = match self.loader {
            Some(loader) => loader,
            None => Arc::new(StaticPluginLoader::new()),
        };
        let updates: Arc<dyn UpdateSource> = match self.updates {
            Some(updates) => updates,
            None => Arc::new(StaticUpdateSource::new()),
        };

        let registry = Arc::new(ProviderRegistry::new(
            BreakerConfig {
                failure_threshold: config.failure_threshold,
                cooldown: config.cooldown(),
            },
            config.per_provider_concurrency,
            events.clone(),
        ));
        let priorities = Arc::new(PriorityStore::new());
        let grace = if config.stale_while_revalidate {
            config.stale_grace()
        } else {
            Duration::ZERO
        };
        let cache = Arc::new(ResponseCache::new(grace));
        let scheduler = Arc::new(ExecutionScheduler::new(Arc::clone(&registry)));

        let merger = ResultMerger::new(
            FieldPlanner::new(Arc::clone(&priorities), Arc::clone(&registry)),
            scheduler,
            Arc::clone(&cache),
            Arc::clone(&registry),
            MergerConfig {
                max_concurrent_fields: config.max_concurrent_fields,
                default_ttl: config.default_cache_ttl(),
                stale_while_revalidate: config.stale_while_revalidate,
                refresh_timeout: config.probe_timeout(),
            },
        );

        let lifecycle = PluginLifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&priorities),
            Arc::clone(&cache),
            ArtifactStager::new(config.staging_dir(), artifacts),
            loader,
            updates,
            Arc::clone(&store),
            events.clone(),
            LifecycleConfig {
                retention: config.version_retention,
                probe_timeout: config.probe_timeout(),
                channel: config.update_channel.clone(),
                engine_version: self
                    .engine_version
                    .unwrap_or_else(crate::types::engine_version),
            },
        );

        let engine = MetadataEngine {
            config,
            events,
            registry,
            priorities,
            cache,
            merger,
            lifecycle,
            store,
        };

        let restored = engine.lifecycle.restore().await?;
        for provider in self.builtins {
            engine.lifecycle.install_builtin(provider).await?;
        }

        info!(
            providers = engine.registry.names().len(),
            restored_versions = restored.versions,
            "Metadata engine ready"
        );
        Ok(engine)
    }
}

/// Metadata resolution and plugin orchestration engine
pub struct MetadataEngine {
    config: EngineConfig,
    events: EventBus,
    registry: Arc<ProviderRegistry>,
    priorities: Arc<PriorityStore>,
    cache: Arc<ResponseCache>,
    merger: ResultMerger,
    lifecycle: PluginLifecycleManager,
    store: Arc<dyn StateStore>,
}

impl MetadataEngine {
    pub fn builder(config: EngineConfig) -> MetadataEngineBuilder {
        MetadataEngineBuilder {
            config,
            events: None,
            store: None,
            loader: None,
            updates: None,
            artifacts: None,
            engine_version: None,
            builtins: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Resolution API
    // ========================================================================

    /// Resolve fields for a media entity
    ///
    /// Never fails: every requested field comes back resolved or with the
    /// reason it is unresolved.
    pub async fn resolve<I, S>(&self, media_type: &str, query: &str, fields: I, deadline: Instant) -> Resolution
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = ResolutionRequest::new(media_type, query, fields, deadline);
        self.merger.resolve(&request).await
    }

    /// Resolve a prepared request (custom cancellation, known request id)
    pub async fn resolve_request(&self, request: &ResolutionRequest) -> Resolution {
        self.merger.resolve(request).await
    }

    /// Current candidate order for a field
    pub fn candidates(&self, media_type: &str, field: &str) -> Result<Vec<Candidate>> {
        let plan = self.merger.planner().plan(media_type, field);
        if plan.is_empty() {
            return Err(EngineError::NoProviderAvailable {
                media_type: media_type.to_string(),
                field: field.to_string(),
            });
        }
        Ok(plan)
    }

    // ========================================================================
    // Admin API: priorities
    // ========================================================================

    /// Live priority entries for a field, in resolution order
    pub fn priorities(&self, media_type: &str, field: &str) -> Vec<PriorityEntry> {
        self.priorities.get_ordered(media_type, field)
    }

    /// Every priority entry, soft-deleted included
    pub fn priority_entries(&self) -> Vec<PriorityEntry> {
        self.priorities.entries()
    }

    pub async fn set_priority(
        &self,
        media_type: &str,
        field: &str,
        provider: &str,
        priority: i32,
        fallback: FallbackBehavior,
    ) -> Result<PriorityEntry> {
        let entry = self
            .priorities
            .set_priority(media_type, field, provider, priority, fallback);
        self.store.save_priority(&entry).await?;
        Ok(entry)
    }

    /// Delete one priority entry; returns whether it existed
    pub async fn remove_priority(&self, media_type: &str, field: &str, provider: &str) -> Result<bool> {
        let removed = self.priorities.remove(media_type, field, provider).is_some();
        if removed {
            self.store.delete_priority(media_type, field, provider).await?;
        }
        Ok(removed)
    }

    // ========================================================================
    // Admin API: providers
    // ========================================================================

    pub async fn enable(&self, provider: &str) -> Result<()> {
        self.lifecycle.set_enabled(provider, true).await
    }

    pub async fn disable(&self, provider: &str) -> Result<()> {
        self.lifecycle.set_enabled(provider, false).await
    }

    pub async fn set_provider_settings(&self, provider: &str, settings: ProviderSettings) -> Result<()> {
        self.lifecycle.set_settings(provider, settings).await
    }

    pub fn provider_settings(&self, provider: &str) -> Result<ProviderSettings> {
        Ok((*self.registry.get(provider)?.settings()).clone())
    }

    /// Settings schema of the provider's active version
    pub fn settings_schema(&self, provider: &str) -> Result<SettingsSchema> {
        Ok(self.registry.active(provider)?.provider.settings_schema())
    }

    pub fn health(&self, provider: &str) -> Result<HealthSnapshot> {
        Ok(self.registry.get(provider)?.health().snapshot())
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        self.registry
            .slots()
            .into_iter()
            .map(|slot| {
                let active = slot.active();
                ProviderInfo {
                    name: slot.name().to_string(),
                    active_version: active.version(),
                    enabled: slot.is_enabled(),
                    state: slot.state(),
                    rate_limit_per_minute: active.descriptor.rate_limit_per_minute,
                    versions: slot.records(),
                    health: slot.health().snapshot(),
                }
            })
            .collect()
    }

    /// Force refresh: drop every cached response for a query
    pub fn refresh(&self, query: &str) -> usize {
        let entries = self.cache.invalidate(query);
        info!(query = %query, entries, "Cached metadata invalidated");
        self.events.emit_lossy(EngineEvent::CacheInvalidated {
            query: query.to_string(),
            entries,
            timestamp: trove_common::time::now(),
        });
        entries
    }

    /// Drop cache entries past TTL and stale grace
    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    // ========================================================================
    // Admin API: lifecycle
    // ========================================================================

    pub async fn install(&self, locator: &str, checksum_sha256: &str) -> Result<PluginVersionRecord> {
        self.lifecycle.install(locator, checksum_sha256).await
    }

    pub async fn install_builtin(&self, provider: Arc<dyn MetadataProvider>) -> Result<PluginVersionRecord> {
        self.lifecycle.install_builtin(provider).await
    }

    pub async fn update(&self, provider: &str) -> Result<UpdateOutcome> {
        self.lifecycle.update(provider).await
    }

    pub async fn rollback(&self, provider: &str, target: Option<Version>) -> Result<Version> {
        self.lifecycle.rollback(provider, target).await
    }

    pub async fn uninstall(&self, provider: &str) -> Result<()> {
        self.lifecycle.uninstall(provider).await
    }

    /// Re-read persisted state (normally done once by the builder)
    pub async fn restore(&self) -> Result<RestoreReport> {
        self.lifecycle.restore().await
    }

    /// Write every provider's lifetime counters to the state store
    pub async fn persist_counters(&self) {
        for slot in self.registry.slots() {
            self.lifecycle.persist_state(&slot).await;
        }
    }

    /// Persist counters before the host shuts down
    pub async fn shutdown(&self) {
        self.persist_counters().await;
        info!(providers = self.registry.names().len(), "Metadata engine stopped");
    }
}
