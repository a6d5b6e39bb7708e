//! Event types and broadcast bus for the metadata engine
//!
//! Events are fire-and-forget notifications for admin surfaces and logs.
//! Nothing in the engine depends on an event being received.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Engine event types
///
/// Events are broadcast via [`EventBus`] and serialise with a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Provider circuit opened after repeated failures
    CircuitOpened {
        provider: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// Provider circuit closed after a successful half-open probe
    CircuitClosed {
        provider: String,
        timestamp: DateTime<Utc>,
    },

    /// Plugin installed (disabled until explicitly enabled)
    ProviderInstalled {
        provider: String,
        version: String,
        timestamp: DateTime<Utc>,
    },

    /// Plugin enabled or disabled by an administrator
    ProviderToggled {
        provider: String,
        enabled: bool,
        timestamp: DateTime<Utc>,
    },

    /// Plugin removed; its priority entries were soft-deleted
    ProviderUninstalled {
        provider: String,
        timestamp: DateTime<Utc>,
    },

    /// Update passed its health probe and is now active
    UpdateCommitted {
        provider: String,
        from_version: String,
        to_version: String,
        timestamp: DateTime<Utc>,
    },

    /// Update failed its health probe and the prior version was restored
    UpdateRolledBack {
        provider: String,
        attempted_version: String,
        restored_version: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Administrator rolled a provider back to a retained version
    ManualRollback {
        provider: String,
        from_version: String,
        to_version: String,
        timestamp: DateTime<Utc>,
    },

    /// Cached metadata for a query was dropped ("refresh metadata")
    CacheInvalidated {
        query: String,
        entries: usize,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Event type name, matching the serde tag
    pub fn event_type(&self) -> &str {
        match self {
            EngineEvent::CircuitOpened { .. } => "CircuitOpened",
            EngineEvent::CircuitClosed { .. } => "CircuitClosed",
            EngineEvent::ProviderInstalled { .. } => "ProviderInstalled",
            EngineEvent::ProviderToggled { .. } => "ProviderToggled",
            EngineEvent::ProviderUninstalled { .. } => "ProviderUninstalled",
            EngineEvent::UpdateCommitted { .. } => "UpdateCommitted",
            EngineEvent::UpdateRolledBack { .. } => "UpdateRolledBack",
            EngineEvent::ManualRollback { .. } => "ManualRollback",
            EngineEvent::CacheInvalidated { .. } => "CacheInvalidated",
        }
    }
}

/// Broadcast event bus
///
/// Uses tokio::broadcast internally: publishing never blocks, slow
/// subscribers see `Lagged` instead of stalling producers.
///
/// # Examples
///
/// ```
/// use trove_common::events::{EngineEvent, EventBus};
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(EngineEvent::CircuitClosed {
///     provider: "tmdb".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(rx.try_recv().unwrap().event_type(), "CircuitClosed");
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
