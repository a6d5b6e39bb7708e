//! Priority store
//!
//! Maps (media type, field, provider) to a priority and a fallback policy.
//! Lower priority is consulted first; equal priorities order by provider
//! name so resolution is deterministic. Uninstalled providers' entries are
//! soft-deleted, keeping user customisations for a later reinstall.

use crate::provider::ProviderDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// What to do when a candidate fails or returns nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackBehavior {
    /// Try the next candidate
    #[default]
    Continue,
    /// Leave the field unresolved
    Stop,
    /// Re-invoke the same candidate up to `attempts` more times, then continue
    Retry { attempts: u32, backoff_ms: u64 },
}

impl FallbackBehavior {
    pub fn backoff(&self) -> Duration {
        match self {
            FallbackBehavior::Retry { backoff_ms, .. } => Duration::from_millis(*backoff_ms),
            _ => Duration::ZERO,
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            FallbackBehavior::Retry { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// One priority rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEntry {
    pub media_type: String,
    pub field: String,
    pub provider: String,
    pub priority: i32,
    #[serde(default)]
    pub fallback: FallbackBehavior,
    /// Set by an administrator (as opposed to seeded from a descriptor)
    #[serde(default)]
    pub user_defined: bool,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
}

impl PriorityEntry {
    pub fn is_live(&self) -> bool {
        self.removed_at.is_none()
    }

    fn key(&self) -> EntryKey {
        (
            self.media_type.clone(),
            self.field.clone(),
            self.provider.clone(),
        )
    }
}

type EntryKey = (String, String, String);

/// In-memory priority table
///
/// Persistence is layered on by the engine through the state store.
#[derive(Debug, Default)]
pub struct PriorityStore {
    entries: RwLock<BTreeMap<EntryKey, PriorityEntry>>,
}

impl PriorityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with previously persisted entries
    pub fn load(&self, entries: impl IntoIterator<Item = PriorityEntry>) {
        let mut table = self.entries.write().unwrap_or_else(|p| p.into_inner());
        table.clear();
        for entry in entries {
            table.insert(entry.key(), entry);
        }
    }

    /// Live entries for a field: priority ascending, then provider name
    pub fn get_ordered(&self, media_type: &str, field: &str) -> Vec<PriorityEntry> {
        let table = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut ordered: Vec<PriorityEntry> = table
            .values()
            .filter(|e| e.media_type == media_type && e.field == field && e.is_live())
            .cloned()
            .collect();
        ordered.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.provider.cmp(&b.provider))
        });
        ordered
    }

    /// Upsert an administrator rule
    ///
    /// Marks the entry user-defined and revives it if soft-deleted.
    pub fn set_priority(
        &self,
        media_type: &str,
        field: &str,
        provider: &str,
        priority: i32,
        fallback: FallbackBehavior,
    ) -> PriorityEntry {
        let entry = PriorityEntry {
            media_type: media_type.to_string(),
            field: field.to_string(),
            provider: provider.to_string(),
            priority,
            fallback,
            user_defined: true,
            removed_at: None,
        };
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(entry.key(), entry.clone());
        debug!(
            media_type = %media_type,
            field = %field,
            provider = %provider,
            priority,
            "Priority set"
        );
        entry
    }

    /// Insert default entries for every pair a descriptor declares
    ///
    /// Existing entries are never overwritten. A soft-deleted entry is
    /// revived as it was, so user customisations survive a reinstall.
    /// Returns the entries that were inserted or revived.
    pub fn seed(&self, descriptor: &ProviderDescriptor) -> Vec<PriorityEntry> {
        let mut table = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let mut changed = Vec::new();

        for (media_type, field, default_priority) in descriptor.declared_fields() {
            let key = (
                media_type.to_string(),
                field.to_string(),
                descriptor.name.clone(),
            );
            match table.get_mut(&key) {
                Some(existing) if existing.is_live() => {}
                Some(existing) => {
                    existing.removed_at = None;
                    changed.push(existing.clone());
                }
                None => {
                    let entry = PriorityEntry {
                        media_type: key.0.clone(),
                        field: key.1.clone(),
                        provider: key.2.clone(),
                        priority: default_priority,
                        fallback: FallbackBehavior::Continue,
                        user_defined: false,
                        removed_at: None,
                    };
                    changed.push(entry.clone());
                    table.insert(key, entry);
                }
            }
        }

        changed
    }

    /// Hard-delete one entry
    pub fn remove(&self, media_type: &str, field: &str, provider: &str) -> Option<PriorityEntry> {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(
                media_type.to_string(),
                field.to_string(),
                provider.to_string(),
            ))
    }

    /// Soft-delete every live entry of a provider; returns the updated entries
    pub fn soft_delete_provider(&self, provider: &str, at: DateTime<Utc>) -> Vec<PriorityEntry> {
        let mut table = self.entries.write().unwrap_or_else(|p| p.into_inner());
        table
            .values_mut()
            .filter(|e| e.provider == provider && e.is_live())
            .map(|e| {
                e.removed_at = Some(at);
                e.clone()
            })
            .collect()
    }

    /// Every entry, soft-deleted included
    pub fn entries(&self) -> Vec<PriorityEntry> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
