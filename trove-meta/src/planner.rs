//! Field resolution planner
//!
//! A plan is the priority order for one field, filtered down to providers
//! the registry currently considers capable (enabled, declaring the field in
//! their active version, circuit not open).

use crate::priority::{FallbackBehavior, PriorityStore};
use crate::registry::ProviderRegistry;
use std::collections::HashSet;
use std::sync::Arc;

/// One provider to try for a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub provider: String,
    pub priority: i32,
    pub fallback: FallbackBehavior,
}

pub struct FieldPlanner {
    priorities: Arc<PriorityStore>,
    registry: Arc<ProviderRegistry>,
}

impl FieldPlanner {
    pub fn new(priorities: Arc<PriorityStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            priorities,
            registry,
        }
    }

    /// Ordered candidates for (media type, field); empty means no provider
    pub fn plan(&self, media_type: &str, field: &str) -> Vec<Candidate> {
        let capable: HashSet<String> = self
            .registry
            .list_capable(media_type, field)
            .into_iter()
            .collect();

        self.priorities
            .get_ordered(media_type, field)
            .into_iter()
            .filter(|entry| capable.contains(&entry.provider))
            .map(|entry| Candidate {
                provider: entry.provider,
                priority: entry.priority,
                fallback: entry.fallback,
            })
            .collect()
    }
}
