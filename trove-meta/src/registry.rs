//! Provider registry
//!
//! One [`ProviderSlot`] per provider name. A slot keeps an append-only table
//! of installed versions and a single atomically swapped pointer to the
//! active one (`arc-swap`), so readers always see either the old or the new
//! implementation and never block on a swap. Enable flag, settings, health,
//! rate limiter and concurrency permits all live in the slot, scoped to that
//! provider alone.

use crate::error::{EngineError, Result};
use crate::health::{BreakerConfig, ProviderHealth};
use crate::provider::{MetadataProvider, ProviderDescriptor};
use crate::rate_limit::ProviderRateLimiter;
use crate::settings::ProviderSettings;
use crate::types::Version;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, info};
use trove_common::events::EventBus;

/// Installed plugin version, retained for rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginVersionRecord {
    pub provider: String,
    pub version: Version,
    /// Where the staged artifact lives (`builtin:<name>` for in-process providers)
    pub artifact: String,
    pub checksum_sha256: String,
    pub installed_at: DateTime<Utc>,
    pub uninstalled_at: Option<DateTime<Utc>>,
}

impl PluginVersionRecord {
    pub fn is_live(&self) -> bool {
        self.uninstalled_at.is_none()
    }
}

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Installed,
    Enabled,
    Disabled,
    Updating,
    Active,
    RolledBack,
}

/// One immutable implementation version
pub struct InstalledVersion {
    pub descriptor: ProviderDescriptor,
    pub provider: Arc<dyn MetadataProvider>,
}

impl InstalledVersion {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            descriptor: provider.descriptor().clone(),
            provider,
        }
    }

    pub fn version(&self) -> Version {
        self.descriptor.version
    }
}

impl std::fmt::Debug for InstalledVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledVersion")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .finish()
    }
}

/// Registry entry for one provider name
pub struct ProviderSlot {
    name: String,
    active: ArcSwap<InstalledVersion>,
    versions: RwLock<Vec<Arc<InstalledVersion>>>,
    records: RwLock<Vec<PluginVersionRecord>>,
    enabled: AtomicBool,
    state: Mutex<LifecycleState>,
    settings: ArcSwap<ProviderSettings>,
    health: Arc<ProviderHealth>,
    limiter: ArcSwap<ProviderRateLimiter>,
    permits: Arc<Semaphore>,
    lifecycle_lock: tokio::sync::Mutex<()>,
}

impl ProviderSlot {
    fn new(
        installed: Arc<InstalledVersion>,
        record: PluginVersionRecord,
        breaker: BreakerConfig,
        concurrency: usize,
        events: EventBus,
    ) -> Self {
        let name = installed.descriptor.name.clone();
        let limiter = ProviderRateLimiter::new(installed.descriptor.rate_limit_per_minute);
        Self {
            health: Arc::new(ProviderHealth::new(name.clone(), breaker, events)),
            name,
            active: ArcSwap::new(Arc::clone(&installed)),
            versions: RwLock::new(vec![installed]),
            records: RwLock::new(vec![record]),
            enabled: AtomicBool::new(false),
            state: Mutex::new(LifecycleState::Installed),
            settings: ArcSwap::from_pointee(ProviderSettings::new()),
            limiter: ArcSwap::from_pointee(limiter),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            lifecycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently active implementation (lock-free read)
    pub fn active(&self) -> Arc<InstalledVersion> {
        self.active.load_full()
    }

    pub fn active_version(&self) -> Version {
        self.active.load().version()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn settings(&self) -> Arc<ProviderSettings> {
        self.settings.load_full()
    }

    pub fn set_settings(&self, settings: ProviderSettings) {
        self.settings.store(Arc::new(settings));
    }

    pub fn health(&self) -> &Arc<ProviderHealth> {
        &self.health
    }

    pub fn limiter(&self) -> Arc<ProviderRateLimiter> {
        self.limiter.load_full()
    }

    pub fn permits(&self) -> &Arc<Semaphore> {
        &self.permits
    }

    /// Serialises install/update/rollback for this provider only
    pub fn lifecycle_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.lifecycle_lock
    }

    /// Retained version records, oldest first
    pub fn records(&self) -> Vec<PluginVersionRecord> {
        self.records.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn record(&self, version: Version) -> Option<PluginVersionRecord> {
        self.records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|r| r.version == version)
            .cloned()
    }

    /// Installed implementation for a version, if retained
    pub fn version(&self, version: Version) -> Option<Arc<InstalledVersion>> {
        self.versions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|v| v.version() == version)
            .cloned()
    }

    fn has_live_version(&self, version: Version) -> bool {
        self.record(version).is_some_and(|r| r.is_live())
    }

    fn append(&self, installed: Arc<InstalledVersion>, record: PluginVersionRecord) {
        let version = installed.version();
        {
            let mut versions = self.versions.write().unwrap_or_else(|p| p.into_inner());
            versions.retain(|v| v.version() != version);
            versions.push(installed);
        }
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.retain(|r| r.version != version);
        records.push(record);
    }

    /// Atomically point the slot at a retained live version
    ///
    /// Returns the previously active implementation.
    fn swap_active(&self, version: Version) -> Result<Arc<InstalledVersion>> {
        let target = self
            .version(version)
            .filter(|_| self.has_live_version(version))
            .ok_or_else(|| EngineError::UnknownVersion {
                provider: self.name.clone(),
                version,
            })?;

        let rate = target.descriptor.rate_limit_per_minute;
        if self.limiter.load().per_minute() != rate {
            self.limiter.store(Arc::new(ProviderRateLimiter::new(rate)));
        }

        let previous = self.active.swap(target);
        debug!(
            provider = %self.name,
            from = %previous.version(),
            to = %version,
            "Active version swapped"
        );
        Ok(previous)
    }

    /// Stamp `uninstalled_at` on a record
    pub fn mark_uninstalled(&self, version: Version, at: DateTime<Utc>) -> Option<PluginVersionRecord> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        let record = records.iter_mut().find(|r| r.version == version)?;
        record.uninstalled_at = Some(at);
        Some(record.clone())
    }

    /// Drop a non-active version and its record
    pub fn purge_version(&self, version: Version) -> Result<Option<PluginVersionRecord>> {
        if self.active_version() == version {
            return Err(EngineError::InvalidState {
                provider: self.name.clone(),
                reason: format!("cannot purge active version {}", version),
            });
        }

        self.versions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|v| v.version() != version);

        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        let position = records.iter().position(|r| r.version == version);
        Ok(position.map(|i| records.remove(i)))
    }
}

/// Outcome of [`ProviderRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First version of a new provider name; it is active and disabled
    NewProvider,
    /// Additional version of an existing provider; not active yet
    AdditionalVersion,
}

/// Runtime provider registry indexed by name (and version within a slot)
pub struct ProviderRegistry {
    slots: RwLock<BTreeMap<String, Arc<ProviderSlot>>>,
    breaker: BreakerConfig,
    concurrency: usize,
    events: EventBus,
}

impl ProviderRegistry {
    pub fn new(breaker: BreakerConfig, concurrency: usize, events: EventBus) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            breaker,
            concurrency,
            events,
        }
    }

    /// Register an implementation version
    ///
    /// Fails with `DuplicateProvider` if the same name+version is already
    /// live. A version whose record was marked uninstalled (failed update)
    /// may be registered again.
    pub fn register(
        &self,
        provider: Arc<dyn MetadataProvider>,
        record: PluginVersionRecord,
    ) -> Result<Registration> {
        let installed = Arc::new(InstalledVersion::new(provider));
        let name = installed.descriptor.name.clone();
        let version = installed.version();

        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        match slots.get(&name) {
            Some(slot) => {
                if slot.has_live_version(version) {
                    return Err(EngineError::DuplicateProvider {
                        provider: name,
                        version,
                    });
                }
                slot.append(installed, record);
                debug!(provider = %name, version = %version, "Registered additional version");
                Ok(Registration::AdditionalVersion)
            }
            None => {
                slots.insert(name.clone(), self.new_slot(installed, record));
                info!(provider = %name, version = %version, "Registered provider");
                Ok(Registration::NewProvider)
            }
        }
    }

    /// Register the first version of a provider name
    ///
    /// The name check and the insert happen under one write lock. An
    /// existing name fails with `DuplicateProvider` for the same live
    /// version and `InvalidState` otherwise.
    pub fn register_new(&self, provider: Arc<dyn MetadataProvider>, record: PluginVersionRecord) -> Result<()> {
        let installed = Arc::new(InstalledVersion::new(provider));
        let name = installed.descriptor.name.clone();
        let version = installed.version();

        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots.get(&name) {
            if slot.has_live_version(version) {
                return Err(EngineError::DuplicateProvider {
                    provider: name,
                    version,
                });
            }
            return Err(EngineError::InvalidState {
                provider: name,
                reason: "already installed; use update or rollback".to_string(),
            });
        }

        slots.insert(name.clone(), self.new_slot(installed, record));
        info!(provider = %name, version = %version, "Registered provider");
        Ok(())
    }

    fn new_slot(&self, installed: Arc<InstalledVersion>, record: PluginVersionRecord) -> Arc<ProviderSlot> {
        Arc::new(ProviderSlot::new(
            installed,
            record,
            self.breaker,
            self.concurrency,
            self.events.clone(),
        ))
    }

    /// Remove a provider entirely
    pub fn unregister(&self, name: &str) -> Result<Arc<ProviderSlot>> {
        self.slots
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
            .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<Arc<ProviderSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))
    }

    /// Active implementation of a provider
    pub fn active(&self, name: &str) -> Result<Arc<InstalledVersion>> {
        Ok(self.get(name)?.active())
    }

    /// Retained version records of a provider, oldest first
    pub fn records(&self, name: &str) -> Result<Vec<PluginVersionRecord>> {
        Ok(self.get(name)?.records())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    /// Registered provider names, ascending
    pub fn names(&self) -> Vec<String> {
        self.slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn slots(&self) -> Vec<Arc<ProviderSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Atomically switch the active version
    ///
    /// Fails with `UnknownVersion` if no live record exists for it.
    pub fn set_active_version(&self, name: &str, version: Version) -> Result<Arc<InstalledVersion>> {
        self.get(name)?.swap_active(version)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let slot = self.get(name)?;
        slot.enabled.store(enabled, Ordering::Release);
        slot.set_state(if enabled {
            LifecycleState::Enabled
        } else {
            LifecycleState::Disabled
        });
        Ok(())
    }

    /// Providers able to serve (media type, field) right now
    ///
    /// Enabled, declaring the pair in their active descriptor, and with a
    /// circuit that is not open. Ascending by name.
    pub fn list_capable(&self, media_type: &str, field: &str) -> Vec<String> {
        self.slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|slot| slot.is_enabled())
            .filter(|slot| slot.active.load().descriptor.supports(media_type, field))
            .filter(|slot| !slot.health.is_open())
            .map(|slot| slot.name.clone())
            .collect()
    }
}
