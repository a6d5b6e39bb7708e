//! Plugin lifecycle manager
//!
//! Install, hot update, rollback and uninstall of provider implementations.
//!
//! **Update sequence:**
//! 1. Fetch the manifest and pick the configured channel
//! 2. Skip when the release is not newer than the active version
//! 3. Stage the artifact and verify its SHA-256
//! 4. Load it and check engine compatibility
//! 5. Register the new version and record the rollback target
//! 6. Atomically swap the active pointer
//! 7. Run the provider's health probe with a bounded timeout
//! 8. Commit (retention cleanup) or restore the prior pointer
//!
//! Calls in flight keep the implementation they started with; only new
//! calls see a swap. One lifecycle operation runs per provider at a time.

use crate::artifact::{normalize_checksum, ArtifactStager, StagedArtifact};
use crate::cache::ResponseCache;
use crate::error::{EngineError, Result};
use crate::manifest::{ReleaseInfo, UpdateSource};
use crate::priority::PriorityStore;
use crate::provider::MetadataProvider;
use crate::registry::{LifecycleState, PluginVersionRecord, ProviderRegistry, ProviderSlot};
use crate::settings::ProviderSettings;
use crate::store::{ProviderStateRow, StateStore};
use crate::types::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use trove_common::events::{EngineEvent, EventBus};
use trove_common::time;

/// Locator prefix for providers compiled into the host
pub const BUILTIN_PREFIX: &str = "builtin:";

// ============================================================================
// Plugin loading
// ============================================================================

/// Turns a verified staged artifact into a provider instance
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, artifact: &Path) -> Result<Arc<dyn MetadataProvider>>;
}

/// Identity block at the start of every plugin artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub name: String,
    pub version: Version,
}

pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn MetadataProvider> + Send + Sync>;

/// Loader backed by factories registered in-process, keyed by name+version
///
/// The artifact only carries an [`ArtifactHeader`]; the implementation
/// itself is compiled into the host.
#[derive(Default)]
pub struct StaticPluginLoader {
    factories: RwLock<HashMap<(String, Version), ProviderFactory>>,
}

impl StaticPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, version: Version, factory: F)
    where
        F: Fn() -> Arc<dyn MetadataProvider> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert((name.into(), version), Arc::new(factory));
    }

    /// Artifact content understood by this loader
    pub fn artifact_bytes(name: &str, version: Version) -> Vec<u8> {
        let header = ArtifactHeader {
            name: name.to_string(),
            version,
        };
        serde_json::to_vec(&header).unwrap_or_default()
    }
}

#[async_trait]
impl PluginLoader for StaticPluginLoader {
    async fn load(&self, artifact: &Path) -> Result<Arc<dyn MetadataProvider>> {
        let bytes = tokio::fs::read(artifact).await?;
        let header: ArtifactHeader = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Artifact(format!("{}: bad header: {}", artifact.display(), e))
        })?;

        let factory = self
            .factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(header.name.clone(), header.version))
            .cloned()
            .ok_or_else(|| {
                EngineError::Artifact(format!(
                    "no implementation available for {} {}",
                    header.name, header.version
                ))
            })?;

        let provider = factory();
        let descriptor = provider.descriptor();
        if descriptor.name != header.name || descriptor.version != header.version {
            return Err(EngineError::Artifact(format!(
                "artifact declares {} {} but implementation is {} {}",
                header.name, header.version, descriptor.name, descriptor.version
            )));
        }
        Ok(provider)
    }
}

// ============================================================================
// Lifecycle manager
// ============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Version records kept per provider
    pub retention: usize,
    pub probe_timeout: Duration,
    pub channel: String,
    pub engine_version: Version,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retention: 3,
            probe_timeout: Duration::from_secs(10),
            channel: "stable".to_string(),
            engine_version: crate::types::engine_version(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Manifest release is not newer than the active version
    AlreadyCurrent { version: Version },
    Committed { from: Version, to: Version },
}

/// Summary of a startup restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub priorities: usize,
    pub versions: usize,
    pub providers: usize,
    /// Records that could not be reloaded
    pub skipped: usize,
}

pub struct PluginLifecycleManager {
    registry: Arc<ProviderRegistry>,
    priorities: Arc<PriorityStore>,
    cache: Arc<ResponseCache>,
    stager: ArtifactStager,
    loader: Arc<dyn PluginLoader>,
    updates: Arc<dyn UpdateSource>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    config: LifecycleConfig,
}

impl PluginLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        priorities: Arc<PriorityStore>,
        cache: Arc<ResponseCache>,
        stager: ArtifactStager,
        loader: Arc<dyn PluginLoader>,
        updates: Arc<dyn UpdateSource>,
        store: Arc<dyn StateStore>,
        events: EventBus,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            priorities,
            cache,
            stager,
            loader,
            updates,
            store,
            events,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn check_compatible(&self, provider: &str, required: Option<Version>) -> Result<()> {
        match required {
            Some(required) if required > self.config.engine_version => {
                Err(EngineError::IncompatibleVersion {
                    provider: provider.to_string(),
                    required,
                    engine: self.config.engine_version,
                })
            }
            _ => Ok(()),
        }
    }

    /// Stage, verify and load an artifact; the staged file is removed on failure
    async fn stage_and_load(
        &self,
        locator: &str,
        checksum: &str,
    ) -> Result<(StagedArtifact, Arc<dyn MetadataProvider>)> {
        let staged = self.stager.stage(locator, checksum).await?;

        let loaded = match self.loader.load(&staged.path).await {
            Ok(provider) => {
                let descriptor = provider.descriptor();
                self.check_compatible(&descriptor.name, descriptor.min_engine_version)
                    .map(|_| provider)
            }
            Err(e) => Err(e),
        };

        match loaded {
            Ok(provider) => Ok((staged, provider)),
            Err(e) => {
                self.discard(&staged.path).await;
                Err(e)
            }
        }
    }

    /// Delete a staged artifact unless a live record still points at it
    ///
    /// Staged files are content-addressed, so a re-staged release lands on
    /// the file an already retained version uses.
    async fn discard(&self, path: &Path) {
        if self.artifact_in_use(path) {
            debug!(path = %path.display(), "Staged artifact still in use, kept");
            return;
        }
        if let Err(e) = self.stager.remove(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove staged artifact");
        }
    }

    // ------------------------------------------------------------------------
    // Install / uninstall
    // ------------------------------------------------------------------------

    /// Install a new provider from an artifact; it starts disabled
    pub async fn install(&self, locator: &str, checksum_sha256: &str) -> Result<PluginVersionRecord> {
        let (staged, provider) = self.stage_and_load(locator, checksum_sha256).await?;

        let record = PluginVersionRecord {
            provider: provider.descriptor().name.clone(),
            version: provider.descriptor().version,
            artifact: staged.path.display().to_string(),
            checksum_sha256: staged.checksum_sha256.clone(),
            installed_at: time::now(),
            uninstalled_at: None,
        };

        if let Err(e) = self.register_new(provider, record.clone()).await {
            self.discard(&staged.path).await;
            return Err(e);
        }
        Ok(record)
    }

    /// Is a staged file still referenced by a live version record?
    fn artifact_in_use(&self, path: &Path) -> bool {
        self.registry
            .slots()
            .iter()
            .flat_map(|slot| slot.records())
            .any(|r| r.is_live() && Path::new(&r.artifact) == path)
    }

    /// Install a provider compiled into the host
    ///
    /// Any persisted state for it (enabled flag, settings, counters) is
    /// applied after registration.
    pub async fn install_builtin(&self, provider: Arc<dyn MetadataProvider>) -> Result<PluginVersionRecord> {
        let descriptor = provider.descriptor().clone();
        self.check_compatible(&descriptor.name, descriptor.min_engine_version)?;

        let record = PluginVersionRecord {
            provider: descriptor.name.clone(),
            version: descriptor.version,
            artifact: format!("{}{}", BUILTIN_PREFIX, descriptor.name),
            checksum_sha256: String::new(),
            installed_at: time::now(),
            uninstalled_at: None,
        };

        let persisted = match self.store.load_provider_states().await {
            Ok(rows) => rows.into_iter().find(|r| r.provider == descriptor.name),
            Err(e) => {
                warn!(provider = %descriptor.name, error = %e, "Could not read persisted provider state");
                None
            }
        };

        self.register_new(provider, record.clone()).await?;

        if let Some(row) = persisted {
            let slot = self.registry.get(&descriptor.name)?;
            self.apply_state_row(&slot, &row);
            self.persist_state(&slot).await;
        }
        Ok(record)
    }

    async fn register_new(&self, provider: Arc<dyn MetadataProvider>, record: PluginVersionRecord) -> Result<()> {
        let descriptor = provider.descriptor().clone();
        self.registry.register_new(provider, record.clone())?;
        let seeded = self.priorities.seed(&descriptor);
        for entry in &seeded {
            self.persist(self.store.save_priority(entry).await, &descriptor.name);
        }
        self.persist(self.store.save_version(&record).await, &descriptor.name);
        let slot = self.registry.get(&descriptor.name)?;
        self.persist_state(&slot).await;

        info!(
            provider = %descriptor.name,
            version = %descriptor.version,
            seeded = seeded.len(),
            "Provider installed (disabled)"
        );
        self.events.emit_lossy(EngineEvent::ProviderInstalled {
            provider: descriptor.name.clone(),
            version: descriptor.version.to_string(),
            timestamp: time::now(),
        });
        Ok(())
    }

    /// Remove a provider
    ///
    /// Priority entries are soft-deleted (kept for a reinstall), cached
    /// responses dropped and staged artifacts deleted.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        let slot = self.registry.get(name)?;
        let _guard = slot
            .lifecycle_lock()
            .try_lock()
            .map_err(|_| EngineError::LifecycleBusy(name.to_string()))?;

        self.registry.unregister(name)?;

        for entry in self.priorities.soft_delete_provider(name, time::now()) {
            self.persist(self.store.save_priority(&entry).await, name);
        }
        let dropped = self.cache.invalidate_provider(name);

        for record in slot.records() {
            if !record.artifact.starts_with(BUILTIN_PREFIX) {
                self.discard(Path::new(&record.artifact)).await;
            }
            self.persist(self.store.delete_version(name, record.version).await, name);
        }
        self.persist(self.store.delete_provider_state(name).await, name);

        info!(provider = %name, cache_entries = dropped, "Provider uninstalled");
        self.events.emit_lossy(EngineEvent::ProviderUninstalled {
            provider: name.to_string(),
            timestamp: time::now(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Enable / settings
    // ------------------------------------------------------------------------

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(name, enabled)?;
        let slot = self.registry.get(name)?;
        self.persist_state(&slot).await;

        info!(provider = %name, enabled, "Provider toggled");
        self.events.emit_lossy(EngineEvent::ProviderToggled {
            provider: name.to_string(),
            enabled,
            timestamp: time::now(),
        });
        Ok(())
    }

    /// Validate and store provider settings; cached responses are dropped
    pub async fn set_settings(&self, name: &str, settings: ProviderSettings) -> Result<()> {
        let slot = self.registry.get(name)?;
        slot.active()
            .provider
            .settings_schema()
            .validate(&settings)
            .map_err(|e| EngineError::InvalidSettings {
                provider: name.to_string(),
                reason: e.to_string(),
            })?;

        slot.set_settings(settings);
        let dropped = self.cache.invalidate_provider(name);
        self.persist_state(&slot).await;
        debug!(provider = %name, cache_entries = dropped, "Provider settings updated");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Update / rollback
    // ------------------------------------------------------------------------

    /// Hot-update a provider from its update source
    pub async fn update(&self, name: &str) -> Result<UpdateOutcome> {
        let slot = self.registry.get(name)?;
        let _guard = slot
            .lifecycle_lock()
            .try_lock()
            .map_err(|_| EngineError::LifecycleBusy(name.to_string()))?;

        let manifest = self.updates.manifest(name).await?;
        if manifest.name != name {
            return Err(EngineError::Manifest(format!(
                "manifest for {} requested, got {}",
                name, manifest.name
            )));
        }
        let release = manifest.release(&self.config.channel)?.clone();

        let current = slot.active_version();
        if release.version <= current {
            debug!(provider = %name, version = %current, "Already current");
            return Ok(UpdateOutcome::AlreadyCurrent { version: current });
        }
        self.check_compatible(name, release.min_engine_version)?;

        let previous_state = slot.state();
        slot.set_state(LifecycleState::Updating);
        let prepared = match self.retained(&slot, &release.checksum_sha256, release.version) {
            Some(retained) => retained,
            None => self.stage_release(name, &release).await,
        };
        let (provider, record) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                slot.set_state(previous_state);
                return Err(e);
            }
        };
        let descriptor = provider.descriptor().clone();

        let rollback_target = self.registry.set_active_version(name, release.version)?.version();
        info!(
            provider = %name,
            from = %rollback_target,
            to = %release.version,
            "Active version swapped, probing"
        );

        match self.probe(&slot, provider.as_ref()).await {
            Ok(()) => {
                slot.health().reset();
                Self::settle(&slot, LifecycleState::Active);
                for entry in self.priorities.seed(&descriptor) {
                    self.persist(self.store.save_priority(&entry).await, name);
                }
                self.persist_state(&slot).await;

                info!(provider = %name, from = %rollback_target, to = %release.version, "Update committed");
                self.events.emit_lossy(EngineEvent::UpdateCommitted {
                    provider: name.to_string(),
                    from_version: rollback_target.to_string(),
                    to_version: release.version.to_string(),
                    timestamp: time::now(),
                });

                self.cleanup(&slot, Some(rollback_target)).await;
                Ok(UpdateOutcome::Committed {
                    from: rollback_target,
                    to: release.version,
                })
            }
            Err(reason) => {
                self.registry.set_active_version(name, rollback_target)?;
                if let Some(failed) = slot.mark_uninstalled(release.version, time::now()) {
                    self.persist(self.store.save_version(&failed).await, name);
                }
                if !record.artifact.starts_with(BUILTIN_PREFIX) {
                    self.discard(Path::new(&record.artifact)).await;
                }
                Self::settle(&slot, LifecycleState::RolledBack);
                self.persist_state(&slot).await;
                self.cleanup(&slot, Some(rollback_target)).await;

                warn!(
                    provider = %name,
                    attempted = %release.version,
                    restored = %rollback_target,
                    reason = %reason,
                    "Update rolled back"
                );
                self.events.emit_lossy(EngineEvent::UpdateRolledBack {
                    provider: name.to_string(),
                    attempted_version: release.version.to_string(),
                    restored_version: rollback_target.to_string(),
                    reason: reason.clone(),
                    timestamp: time::now(),
                });

                Err(EngineError::UpdateRolledBack {
                    provider: name.to_string(),
                    attempted: release.version,
                    restored: rollback_target,
                    reason,
                })
            }
        }
    }

    /// A live retained version matching the release, if any
    fn retained(
        &self,
        slot: &ProviderSlot,
        checksum: &str,
        version: Version,
    ) -> Option<Result<(Arc<dyn MetadataProvider>, PluginVersionRecord)>> {
        let record = slot.record(version).filter(|r| r.is_live())?;
        let installed = slot.version(version)?;
        if normalize_checksum(&record.checksum_sha256) != normalize_checksum(checksum) {
            return Some(Err(EngineError::ChecksumMismatch {
                expected: normalize_checksum(checksum),
                actual: record.checksum_sha256,
            }));
        }
        debug!(provider = %slot.name(), version = %version, "Release already retained");
        Some(Ok((Arc::clone(&installed.provider), record)))
    }

    /// Stage and register a release as an additional version
    async fn stage_release(
        &self,
        name: &str,
        release: &ReleaseInfo,
    ) -> Result<(Arc<dyn MetadataProvider>, PluginVersionRecord)> {
        let (staged, provider) = self
            .stage_and_load(&release.download_url, &release.checksum_sha256)
            .await?;
        let descriptor = provider.descriptor();
        if descriptor.name != name || descriptor.version != release.version {
            let err = EngineError::Artifact(format!(
                "manifest promised {} {}, artifact contains {} {}",
                name, release.version, descriptor.name, descriptor.version
            ));
            self.discard(&staged.path).await;
            return Err(err);
        }

        let record = PluginVersionRecord {
            provider: name.to_string(),
            version: release.version,
            artifact: staged.path.display().to_string(),
            checksum_sha256: staged.checksum_sha256.clone(),
            installed_at: time::now(),
            uninstalled_at: None,
        };
        if let Err(e) = self.registry.register(Arc::clone(&provider), record.clone()) {
            self.discard(&staged.path).await;
            return Err(e);
        }
        self.persist(self.store.save_version(&record).await, name);
        Ok((provider, record))
    }

    /// Set a lifecycle state, keeping a disabled provider `Disabled`
    fn settle(slot: &ProviderSlot, state: LifecycleState) {
        slot.set_state(if slot.is_enabled() {
            state
        } else {
            LifecycleState::Disabled
        });
    }

    /// Bounded health probe of a freshly swapped-in version
    async fn probe(&self, slot: &ProviderSlot, provider: &dyn MetadataProvider) -> std::result::Result<(), String> {
        let schema = provider.settings_schema();
        let stored = slot.settings();
        schema
            .validate(&stored)
            .map_err(|e| format!("settings rejected by new version: {}", e))?;
        let settings = schema.with_defaults(&stored);

        match tokio::time::timeout(self.config.probe_timeout, provider.probe(&settings)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("probe failed: {}", e)),
            Err(_) => Err(format!(
                "probe timed out after {}s",
                self.config.probe_timeout.as_secs()
            )),
        }
    }

    /// Switch back to a retained version
    ///
    /// Without a target, the most recently installed live version other
    /// than the active one is used.
    pub async fn rollback(&self, name: &str, target: Option<Version>) -> Result<Version> {
        let slot = self.registry.get(name)?;
        let _guard = slot
            .lifecycle_lock()
            .try_lock()
            .map_err(|_| EngineError::LifecycleBusy(name.to_string()))?;

        let current = slot.active_version();
        let target = match target {
            Some(version) => version,
            None => slot
                .records()
                .into_iter()
                .filter(|r| r.is_live() && r.version != current)
                .max_by_key(|r| r.installed_at)
                .map(|r| r.version)
                .ok_or_else(|| EngineError::InvalidState {
                    provider: name.to_string(),
                    reason: "no retained version to roll back to".to_string(),
                })?,
        };

        if target == current {
            return Err(EngineError::InvalidState {
                provider: name.to_string(),
                reason: format!("{} is already active", target),
            });
        }

        self.registry.set_active_version(name, target)?;
        slot.health().reset();
        Self::settle(&slot, LifecycleState::RolledBack);
        self.persist_state(&slot).await;

        info!(provider = %name, from = %current, to = %target, "Manual rollback");
        self.events.emit_lossy(EngineEvent::ManualRollback {
            provider: name.to_string(),
            from_version: current.to_string(),
            to_version: target.to_string(),
            timestamp: time::now(),
        });
        Ok(target)
    }

    /// Drop version records beyond the retention limit
    ///
    /// The active version and the rollback target always survive; the
    /// remaining room goes to live records before failed ones, newest first.
    async fn cleanup(&self, slot: &ProviderSlot, rollback_target: Option<Version>) {
        let mut records = slot.records();
        records.sort_by(|a, b| {
            b.is_live()
                .cmp(&a.is_live())
                .then(b.installed_at.cmp(&a.installed_at))
        });

        let mut keep: HashSet<Version> = HashSet::new();
        keep.insert(slot.active_version());
        keep.extend(rollback_target);
        for record in &records {
            if keep.len() >= self.config.retention {
                break;
            }
            keep.insert(record.version);
        }

        for record in records.into_iter().filter(|r| !keep.contains(&r.version)) {
            match slot.purge_version(record.version) {
                Ok(_) => {
                    if !record.artifact.starts_with(BUILTIN_PREFIX) {
                        self.discard(Path::new(&record.artifact)).await;
                    }
                    self.persist(
                        self.store.delete_version(slot.name(), record.version).await,
                        slot.name(),
                    );
                    debug!(provider = %slot.name(), version = %record.version, "Retention: version purged");
                }
                Err(e) => {
                    warn!(provider = %slot.name(), version = %record.version, error = %e, "Retention purge failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    fn persist(&self, result: Result<()>, provider: &str) {
        if let Err(e) = result {
            warn!(provider = %provider, error = %e, "Failed to persist lifecycle state");
        }
    }

    fn state_row(slot: &ProviderSlot) -> ProviderStateRow {
        let health = slot.health().snapshot();
        ProviderStateRow {
            provider: slot.name().to_string(),
            active_version: slot.active_version(),
            enabled: slot.is_enabled(),
            settings: (*slot.settings()).clone(),
            successes: health.successes,
            failures: health.failures,
        }
    }

    /// Write a provider's runtime state row
    pub async fn persist_state(&self, slot: &ProviderSlot) {
        let row = Self::state_row(slot);
        self.persist(self.store.save_provider_state(&row).await, slot.name());
    }

    fn apply_state_row(&self, slot: &ProviderSlot, row: &ProviderStateRow) {
        if slot.active_version() != row.active_version {
            if let Err(e) = self.registry.set_active_version(slot.name(), row.active_version) {
                warn!(provider = %slot.name(), error = %e, "Persisted active version unavailable");
            }
        }
        if let Err(e) = self.registry.set_enabled(slot.name(), row.enabled) {
            warn!(provider = %slot.name(), error = %e, "Could not restore enabled flag");
        }
        slot.set_settings(row.settings.clone());
        slot.health().restore_counters(row.successes, row.failures);
    }

    /// Rebuild runtime state from the state store
    ///
    /// Artifacts are re-verified and reloaded; records that fail are
    /// skipped with a warning. Builtin providers only get their state
    /// applied once the host installs them.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        let priorities = self.store.load_priorities().await?;
        report.priorities = priorities.len();
        self.priorities.load(priorities);

        let mut grouped: BTreeMap<String, Vec<PluginVersionRecord>> = BTreeMap::new();
        for record in self.store.load_versions().await? {
            grouped.entry(record.provider.clone()).or_default().push(record);
        }
        let states: HashMap<String, ProviderStateRow> = self
            .store
            .load_provider_states()
            .await?
            .into_iter()
            .map(|row| (row.provider.clone(), row))
            .collect();

        for (name, mut records) in grouped {
            records.sort_by_key(|r| r.installed_at);
            let mut loaded_any = false;

            for record in records.into_iter().filter(|r| r.is_live()) {
                if record.artifact.starts_with(BUILTIN_PREFIX) {
                    continue;
                }
                match self.reload(&record).await {
                    Ok(provider) => match self.registry.register(provider, record.clone()) {
                        Ok(_) => {
                            report.versions += 1;
                            loaded_any = true;
                        }
                        Err(e) => {
                            warn!(provider = %name, version = %record.version, error = %e, "Restore: register failed");
                            report.skipped += 1;
                        }
                    },
                    Err(e) => {
                        warn!(provider = %name, version = %record.version, error = %e, "Restore: artifact unusable");
                        report.skipped += 1;
                    }
                }
            }

            if !loaded_any {
                continue;
            }
            let slot = self.registry.get(&name)?;
            if let Some(row) = states.get(&name) {
                self.apply_state_row(&slot, row);
            }
            report.providers += 1;
        }

        info!(
            priorities = report.priorities,
            versions = report.versions,
            providers = report.providers,
            skipped = report.skipped,
            "Engine state restored"
        );
        Ok(report)
    }

    async fn reload(&self, record: &PluginVersionRecord) -> Result<Arc<dyn MetadataProvider>> {
        let path = Path::new(&record.artifact);
        self.stager.verify(path, &record.checksum_sha256).await?;
        let provider = self.loader.load(path).await?;
        let descriptor = provider.descriptor();
        if descriptor.name != record.provider || descriptor.version != record.version {
            return Err(EngineError::Artifact(format!(
                "{} no longer contains {} {}",
                record.artifact, record.provider, record.version
            )));
        }
        Ok(provider)
    }
}
