//! Execution scheduler
//!
//! Runs one provider call under every per-provider guard, in order:
//! settings validation, circuit admission, rate-limit token, concurrency
//! permit, then the call itself raced against the request deadline and the
//! request's cancellation token. The outcome is recorded into the
//! provider's health before returning.
//!
//! The active implementation is captured once at the start, so an update
//! swapping the active version mid-call never affects a call in flight.

use crate::error::{EngineError, Result};
use crate::health::{Admission, ProviderHealth};
use crate::provider::{ProviderCall, ProviderError, ProviderPayload};
use crate::registry::{InstalledVersion, ProviderRegistry, ProviderSlot};
use crate::types::Version;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What one invocation did
#[derive(Debug)]
pub struct InvocationReport {
    /// Version that served (or would have served) the call
    pub version: Option<Version>,
    pub elapsed: Duration,
    pub result: Result<ProviderPayload>,
}

/// Circuit admission that must be settled exactly once
///
/// Dropping an unsettled admission (rate-limit rejection, cancellation,
/// permit timeout) releases it without counting as a provider failure.
struct AdmissionGuard {
    health: Arc<ProviderHealth>,
    admission: Option<Admission>,
}

impl AdmissionGuard {
    fn new(health: Arc<ProviderHealth>, admission: Admission) -> Self {
        Self {
            health,
            admission: Some(admission),
        }
    }

    fn success(mut self, latency: Duration) {
        if let Some(admission) = self.admission.take() {
            self.health.record_success(admission, latency);
        }
    }

    fn failure(mut self, latency: Duration) {
        if let Some(admission) = self.admission.take() {
            self.health.record_failure(admission, latency);
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.health.release(admission);
        }
    }
}

/// Per-provider bounded executor
pub struct ExecutionScheduler {
    registry: Arc<ProviderRegistry>,
}

impl ExecutionScheduler {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke a provider's active version
    pub async fn invoke(
        &self,
        provider: &str,
        media_type: &str,
        query: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> InvocationReport {
        let started = Instant::now();

        let slot = match self.registry.get(provider) {
            Ok(slot) => slot,
            Err(e) => {
                return InvocationReport {
                    version: None,
                    elapsed: started.elapsed(),
                    result: Err(e),
                }
            }
        };
        let installed = slot.active();

        let result = self
            .run(&slot, &installed, media_type, query, deadline, cancel)
            .await;

        if let Err(e) = &result {
            debug!(
                provider = %provider,
                version = %installed.version(),
                error = %e,
                "Provider invocation failed"
            );
        }

        InvocationReport {
            version: Some(installed.version()),
            elapsed: started.elapsed(),
            result,
        }
    }

    async fn run(
        &self,
        slot: &ProviderSlot,
        installed: &InstalledVersion,
        media_type: &str,
        query: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ProviderPayload> {
        let name = slot.name();

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                provider: name.to_string(),
            });
        }
        if Instant::now() >= deadline {
            return Err(EngineError::ProviderTimeout {
                provider: name.to_string(),
            });
        }

        let schema = installed.provider.settings_schema();
        let stored = slot.settings();
        schema
            .validate(&stored)
            .map_err(|e| EngineError::InvalidSettings {
                provider: name.to_string(),
                reason: e.to_string(),
            })?;
        let settings = Arc::new(schema.with_defaults(&stored));

        let guard = AdmissionGuard::new(Arc::clone(slot.health()), slot.health().admit()?);

        let limiter = slot.limiter();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EngineError::Cancelled { provider: name.to_string() });
            }
            acquired = limiter.acquire(name, deadline) => acquired?,
        }

        let permits = Arc::clone(slot.permits());
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EngineError::Cancelled { provider: name.to_string() });
            }
            permit = tokio::time::timeout_at(deadline, permits.acquire_owned()) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(EngineError::ProviderUnavailable { provider: name.to_string() });
                }
                Err(_) => {
                    return Err(EngineError::ProviderTimeout { provider: name.to_string() });
                }
            },
        };

        let call_token = cancel.child_token();
        let call = ProviderCall {
            media_type: media_type.to_string(),
            query: query.to_string(),
            settings,
            cancel: call_token.clone(),
        };

        let call_started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                call_token.cancel();
                return Err(EngineError::Cancelled { provider: name.to_string() });
            }
            _ = tokio::time::sleep_until(deadline) => {
                call_token.cancel();
                guard.failure(call_started.elapsed());
                return Err(EngineError::ProviderTimeout { provider: name.to_string() });
            }
            outcome = installed.provider.fetch(&call) => outcome,
        };
        let latency = call_started.elapsed();

        match outcome {
            Ok(payload) => {
                guard.success(latency);
                Ok(payload)
            }
            // Upstream answered; it simply has nothing for this query
            Err(ProviderError::NotFound) => {
                guard.success(latency);
                Ok(ProviderPayload::new())
            }
            Err(ProviderError::Cancelled) => Err(EngineError::Cancelled {
                provider: name.to_string(),
            }),
            Err(ProviderError::InvalidResponse(reason)) => {
                guard.failure(latency);
                Err(EngineError::ProviderInvalidResponse {
                    provider: name.to_string(),
                    reason,
                })
            }
            Err(ProviderError::Network(reason)) | Err(ProviderError::Other(reason)) => {
                guard.failure(latency);
                Err(EngineError::ProviderFailed {
                    provider: name.to_string(),
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{BreakerConfig, CircuitState};
    use crate::provider::{Capability, MetadataProvider, ProviderDescriptor};
    use crate::registry::PluginVersionRecord;
    use crate::settings::{SettingField, SettingType, SettingsSchema};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trove_common::events::EventBus;

    enum Behavior {
        Title,
        Sleep(Duration),
        NotFound,
        Invalid,
    }

    struct Mock {
        descriptor: ProviderDescriptor,
        behavior: Behavior,
        schema: SettingsSchema,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Mock {
        fn new(behavior: Behavior) -> Self {
            Self {
                descriptor: ProviderDescriptor::new("tmdb", Version::new(1, 0, 0))
                    .with_capability(Capability::new("movie", ["title"], 1)),
                behavior,
                schema: SettingsSchema::default(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MetadataProvider for Mock {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        fn settings_schema(&self) -> SettingsSchema {
            self.schema.clone()
        }

        async fn fetch(&self, call: &ProviderCall) -> std::result::Result<ProviderPayload, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = match &self.behavior {
                Behavior::Title => Ok(ProviderPayload::new().with("title", json!(call.query))),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(ProviderPayload::new().with("title", json!("late")))
                }
                Behavior::NotFound => Err(ProviderError::NotFound),
                Behavior::Invalid => Err(ProviderError::InvalidResponse("not json".into())),
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn setup(mock: Arc<Mock>, concurrency: usize) -> (Arc<ProviderRegistry>, ExecutionScheduler) {
        let registry = Arc::new(ProviderRegistry::new(
            BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(60),
            },
            concurrency,
            EventBus::new(16),
        ));
        let record = PluginVersionRecord {
            provider: "tmdb".into(),
            version: Version::new(1, 0, 0),
            artifact: "builtin:tmdb".into(),
            checksum_sha256: String::new(),
            installed_at: Utc::now(),
            uninstalled_at: None,
        };
        registry.register(mock, record).unwrap();
        let scheduler = ExecutionScheduler::new(Arc::clone(&registry));
        (registry, scheduler)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_success_records_health() {
        let mock = Arc::new(Mock::new(Behavior::Title));
        let (registry, scheduler) = setup(mock, 4);

        let report = scheduler
            .invoke("tmdb", "movie", "Alien", soon(), &CancellationToken::new())
            .await;
        let payload = report.result.unwrap();
        assert_eq!(payload.get("title"), Some(&json!("Alien")));
        assert_eq!(report.version, Some(Version::new(1, 0, 0)));

        let snapshot = registry.get("tmdb").unwrap().health().snapshot();
        assert_eq!(snapshot.successes, 1);
        assert!(snapshot.avg_latency_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_timeout_and_counts_as_failure() {
        let mock = Arc::new(Mock::new(Behavior::Sleep(Duration::from_secs(10))));
        let (registry, scheduler) = setup(mock, 4);

        let deadline = Instant::now() + Duration::from_millis(100);
        let report = scheduler
            .invoke("tmdb", "movie", "Alien", deadline, &CancellationToken::new())
            .await;
        assert!(matches!(report.result, Err(EngineError::ProviderTimeout { .. })));
        assert_eq!(registry.get("tmdb").unwrap().health().snapshot().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_a_failure() {
        let mock = Arc::new(Mock::new(Behavior::Sleep(Duration::from_secs(10))));
        let (registry, scheduler) = setup(mock, 4);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = scheduler
            .invoke("tmdb", "movie", "Alien", soon(), &cancel)
            .await;
        assert!(matches!(report.result, Err(EngineError::Cancelled { .. })));

        let snapshot = registry.get("tmdb").unwrap().health().snapshot();
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.successes, 0);
    }

    #[tokio::test]
    async fn test_not_found_is_empty_success() {
        let mock = Arc::new(Mock::new(Behavior::NotFound));
        let (registry, scheduler) = setup(mock, 4);

        let report = scheduler
            .invoke("tmdb", "movie", "nope", soon(), &CancellationToken::new())
            .await;
        assert!(report.result.unwrap().is_empty());
        assert_eq!(registry.get("tmdb").unwrap().health().snapshot().successes, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_call() {
        let mock = Arc::new(Mock::new(Behavior::Invalid));
        let (registry, scheduler) = setup(Arc::clone(&mock), 4);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let report = scheduler.invoke("tmdb", "movie", "q", soon(), &cancel).await;
            assert!(matches!(
                report.result,
                Err(EngineError::ProviderInvalidResponse { .. })
            ));
        }
        assert_eq!(
            registry.get("tmdb").unwrap().health().state(),
            CircuitState::Open
        );

        let report = scheduler.invoke("tmdb", "movie", "q", soon(), &cancel).await;
        assert!(matches!(report.result, Err(EngineError::ProviderUnavailable { .. })));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_call() {
        let mut mock = Mock::new(Behavior::Title);
        mock.schema = SettingsSchema::new(vec![
            SettingField::new("api_key", "API key", SettingType::Password).required(),
        ]);
        let mock = Arc::new(mock);
        let (registry, scheduler) = setup(Arc::clone(&mock), 4);

        let report = scheduler
            .invoke("tmdb", "movie", "q", soon(), &CancellationToken::new())
            .await;
        assert!(matches!(report.result, Err(EngineError::InvalidSettings { .. })));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

        let mut settings = crate::settings::ProviderSettings::new();
        settings.insert("api_key".into(), json!("secret"));
        registry.get("tmdb").unwrap().set_settings(settings);
        let report = scheduler
            .invoke("tmdb", "movie", "q", soon(), &CancellationToken::new())
            .await;
        assert!(report.result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let mock = Arc::new(Mock::new(Behavior::Sleep(Duration::from_millis(100))));
        let (_registry, scheduler) = setup(Arc::clone(&mock), 2);
        let scheduler = Arc::new(scheduler);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler
                        .invoke("tmdb", "movie", &format!("q{i}"), soon(), &CancellationToken::new())
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().result.is_ok());
        }
        assert_eq!(mock.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let mock = Arc::new(Mock::new(Behavior::Title));
        let (_registry, scheduler) = setup(mock, 4);
        let report = scheduler
            .invoke("nobody", "movie", "q", soon(), &CancellationToken::new())
            .await;
        assert!(report.version.is_none());
        assert!(matches!(report.result, Err(EngineError::UnknownProvider(_))));
    }
}
