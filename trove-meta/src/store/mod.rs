//! Persisted engine state
//!
//! The engine keeps everything it needs in memory and writes through to a
//! [`StateStore`] on every mutation. On startup the stored rows are read
//! back and replayed. Cache and breaker state are never persisted; only
//! lifetime counters survive a restart.

use crate::error::Result;
use crate::priority::PriorityEntry;
use crate::registry::PluginVersionRecord;
use crate::settings::ProviderSettings;
use crate::types::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[cfg(feature = "sqlx")]
pub mod sqlite;

#[cfg(feature = "sqlx")]
pub use sqlite::SqliteStateStore;

/// Per-provider runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStateRow {
    pub provider: String,
    pub active_version: Version,
    pub enabled: bool,
    #[serde(default)]
    pub settings: ProviderSettings,
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub failures: u64,
}

/// Narrow persistence surface for priorities, version records and provider state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_priorities(&self) -> Result<Vec<PriorityEntry>>;
    async fn save_priority(&self, entry: &PriorityEntry) -> Result<()>;
    async fn delete_priority(&self, media_type: &str, field: &str, provider: &str) -> Result<()>;

    async fn load_versions(&self) -> Result<Vec<PluginVersionRecord>>;
    async fn save_version(&self, record: &PluginVersionRecord) -> Result<()>;
    async fn delete_version(&self, provider: &str, version: Version) -> Result<()>;

    async fn load_provider_states(&self) -> Result<Vec<ProviderStateRow>>;
    async fn save_provider_state(&self, row: &ProviderStateRow) -> Result<()>;
    async fn delete_provider_state(&self, provider: &str) -> Result<()>;
}

type PriorityKey = (String, String, String);

/// Volatile store for tests and embedded use without a database
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    priorities: RwLock<BTreeMap<PriorityKey, PriorityEntry>>,
    versions: RwLock<BTreeMap<(String, Version), PluginVersionRecord>>,
    states: RwLock<BTreeMap<String, ProviderStateRow>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_priorities(&self) -> Result<Vec<PriorityEntry>> {
        Ok(self
            .priorities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn save_priority(&self, entry: &PriorityEntry) -> Result<()> {
        self.priorities.write().unwrap_or_else(|p| p.into_inner()).insert(
            (
                entry.media_type.clone(),
                entry.field.clone(),
                entry.provider.clone(),
            ),
            entry.clone(),
        );
        Ok(())
    }

    async fn delete_priority(&self, media_type: &str, field: &str, provider: &str) -> Result<()> {
        self.priorities
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(
                media_type.to_string(),
                field.to_string(),
                provider.to_string(),
            ));
        Ok(())
    }

    async fn load_versions(&self) -> Result<Vec<PluginVersionRecord>> {
        Ok(self
            .versions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn save_version(&self, record: &PluginVersionRecord) -> Result<()> {
        self.versions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert((record.provider.clone(), record.version), record.clone());
        Ok(())
    }

    async fn delete_version(&self, provider: &str, version: Version) -> Result<()> {
        self.versions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(provider.to_string(), version));
        Ok(())
    }

    async fn load_provider_states(&self) -> Result<Vec<ProviderStateRow>> {
        Ok(self
            .states
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn save_provider_state(&self, row: &ProviderStateRow) -> Result<()> {
        self.states
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(row.provider.clone(), row.clone());
        Ok(())
    }

    async fn delete_provider_state(&self, provider: &str) -> Result<()> {
        self.states
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(provider);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::FallbackBehavior;
    use chrono::Utc;

    #[tokio::test]
    async fn test_memory_store_upserts() {
        let store = MemoryStateStore::new();
        let mut entry = PriorityEntry {
            media_type: "movie".into(),
            field: "title".into(),
            provider: "tmdb".into(),
            priority: 1,
            fallback: FallbackBehavior::Continue,
            user_defined: false,
            removed_at: None,
        };
        store.save_priority(&entry).await.unwrap();
        entry.priority = 7;
        store.save_priority(&entry).await.unwrap();

        let loaded = store.load_priorities().await.unwrap();
        assert_eq!(loaded, vec![entry]);

        store.delete_priority("movie", "title", "tmdb").await.unwrap();
        assert!(store.load_priorities().await.unwrap().is_empty());

        let record = PluginVersionRecord {
            provider: "tmdb".into(),
            version: Version::new(1, 0, 0),
            artifact: "/staging/abc.plugin".into(),
            checksum_sha256: "abc".into(),
            installed_at: Utc::now(),
            uninstalled_at: None,
        };
        store.save_version(&record).await.unwrap();
        store.delete_version("tmdb", Version::new(1, 0, 0)).await.unwrap();
        assert!(store.load_versions().await.unwrap().is_empty());
    }
}
