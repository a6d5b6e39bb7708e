//! Provider health tracking and circuit breaker
//!
//! State machine per provider:
//! - **Closed**: calls pass; consecutive failures counted; reaching the
//!   threshold opens the circuit.
//! - **Open**: calls rejected with `ProviderUnavailable`; after the cooldown
//!   the next admission becomes the half-open probe.
//! - **HalfOpen**: exactly one probe in flight; success closes the circuit,
//!   failure reopens it with a fresh cooldown.
//!
//! Each provider owns its breaker behind its own mutex. Critical sections
//! never await and never touch another provider.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use trove_common::events::{EngineEvent, EventBus};

/// EWMA smoothing factor for latency
const LATENCY_ALPHA: f64 = 0.2;

/// Circuit breaker thresholds
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit state as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Ticket returned by [`ProviderHealth::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Ordinary call through a closed circuit
    Normal,
    /// The single half-open probe
    Probe,
}

/// Point-in-time health statistics for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub avg_latency_ms: Option<f64>,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    avg_latency_ms: Option<f64>,
    successes: u64,
    failures: u64,
    rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            last_success_at: None,
            last_failure_at: None,
            avg_latency_ms: None,
            successes: 0,
            failures: 0,
            rejections: 0,
        }
    }

    fn cooldown_elapsed(&self, cooldown: Duration) -> bool {
        self.opened_at
            .map_or(true, |opened| opened.elapsed() >= cooldown)
    }

    fn observe_latency(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => avg + LATENCY_ALPHA * (ms - avg),
            None => ms,
        });
    }
}

/// Health and circuit breaker for one provider
#[derive(Debug)]
pub struct ProviderHealth {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: EventBus,
}

impl ProviderHealth {
    pub fn new(provider: impl Into<String>, config: BreakerConfig, events: EventBus) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State is plain data; a panicked holder cannot leave it torn
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to place a call
    ///
    /// An open circuit whose cooldown elapsed transitions to half-open and
    /// hands out the single probe ticket.
    pub fn admit(&self) -> Result<Admission, EngineError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open if inner.cooldown_elapsed(self.config.cooldown) => {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(provider = %self.provider, "Circuit half-open, admitting probe");
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.rejections += 1;
                Err(EngineError::ProviderUnavailable {
                    provider: self.provider.clone(),
                })
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, admission: Admission, latency: Duration) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.successes += 1;
        inner.last_success_at = Some(Utc::now());
        inner.observe_latency(latency);

        if admission == Admission::Probe || inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            drop(inner);

            info!(provider = %self.provider, "Circuit closed after successful probe");
            self.events.emit_lossy(EngineEvent::CircuitClosed {
                provider: self.provider.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Record a failed call (error, timeout, invalid response)
    pub fn record_failure(&self, admission: Admission, latency: Duration) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.failures += 1;
        inner.last_failure_at = Some(Utc::now());
        inner.observe_latency(latency);

        let reopen_probe = admission == Admission::Probe;
        let trip = inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold;

        if !(reopen_probe || trip) {
            return;
        }

        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        let failures = inner.consecutive_failures;
        drop(inner);

        warn!(
            provider = %self.provider,
            consecutive_failures = failures,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Circuit opened"
        );
        self.events.emit_lossy(EngineEvent::CircuitOpened {
            provider: self.provider.clone(),
            consecutive_failures: failures,
            timestamp: Utc::now(),
        });
    }

    /// Give back an admission whose call never reached the provider
    ///
    /// Only matters for the probe: the next caller may probe instead.
    pub fn release(&self, admission: Admission) {
        if admission == Admission::Probe {
            let mut inner = self.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }

    /// True while the circuit is open and its cooldown has not elapsed
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        inner.state == CircuitState::Open && !inner.cooldown_elapsed(self.config.cooldown)
    }

    /// Effective circuit state (an open circuit past cooldown reports half-open)
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if inner.cooldown_elapsed(self.config.cooldown) => {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    /// Return the circuit to closed, keeping lifetime counters
    ///
    /// Used when a different implementation version becomes active.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Seed lifetime counters from persisted state
    pub fn restore_counters(&self, successes: u64, failures: u64) {
        let mut inner = self.lock();
        inner.successes = successes;
        inner.failures = failures;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state();
        let inner = self.lock();
        HealthSnapshot {
            provider: self.provider.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            avg_latency_ms: inner.avg_latency_ms,
            successes: inner.successes,
            failures: inner.failures,
            rejections: inner.rejections,
        }
    }
}
