//! Result merger
//!
//! Resolves every requested field independently and concurrently (bounded by
//! `max_concurrent_fields`). Within a field, candidates are walked strictly
//! in plan order:
//!
//! 1. fresh cache entry for (query, provider, field): accept
//! 2. fresh whole-payload entry for (query, provider): accept the field if
//!    it carries a value, otherwise treat the provider as having answered empty
//! 3. otherwise invoke the provider through the scheduler
//! 4. non-empty value: accept, and write the whole payload through to cache
//! 5. failure or empty value: apply the candidate's fallback policy
//!
//! Exhausting the plan leaves the field unresolved with its attempt log;
//! resolution itself never fails.

use crate::cache::{CacheKey, CacheLookup, ResponseCache};
use crate::error::FailureKind;
use crate::planner::{Candidate, FieldPlanner};
use crate::priority::FallbackBehavior;
use crate::provider::ProviderPayload;
use crate::registry::ProviderRegistry;
use crate::scheduler::ExecutionScheduler;
use crate::types::{is_empty_value, Version, WHOLE_PAYLOAD};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

// ============================================================================
// Request / result model
// ============================================================================

/// One resolution request
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub request_id: Uuid,
    pub media_type: String,
    /// Stable query key: external id or free text
    pub query: String,
    pub fields: Vec<String>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl ResolutionRequest {
    pub fn new<I, S>(media_type: impl Into<String>, query: impl Into<String>, fields: I, deadline: Instant) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request_id: Uuid::new_v4(),
            media_type: media_type.into(),
            query: query.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the request to an external cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Why a field has no value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Planner returned no candidates
    NoProviderAvailable,
    /// Every candidate failed or returned nothing
    Exhausted,
    /// A candidate with `stop` fallback failed
    Stopped,
    /// Request deadline passed
    Timeout,
    /// Request was cancelled
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldStatus {
    Resolved,
    Unresolved { reason: UnresolvedReason },
}

/// Where an accepted value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Staleness {
    /// Fetched from the provider during this request
    Fresh,
    /// Served from cache within TTL
    Cached { age_ms: u64 },
    /// Served past TTL while a background refresh runs
    Stale { age_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    CacheHit,
    StaleHit,
    /// Provider answered without a usable value for the field
    Empty,
    Failed { error: FailureKind, message: String },
}

/// One step of a field's candidate walk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub provider: String,
    pub version: Option<Version>,
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    pub field: String,
    pub value: Option<Value>,
    pub status: FieldStatus,
    pub provider: Option<String>,
    pub staleness: Option<Staleness>,
    pub attempts: Vec<Attempt>,
}

impl FieldResult {
    fn resolved(field: String, provider: &str, value: Value, staleness: Staleness, attempts: Vec<Attempt>) -> Self {
        Self {
            field,
            value: Some(value),
            status: FieldStatus::Resolved,
            provider: Some(provider.to_string()),
            staleness: Some(staleness),
            attempts,
        }
    }

    fn unresolved(field: String, reason: UnresolvedReason, attempts: Vec<Attempt>) -> Self {
        Self {
            field,
            value: None,
            status: FieldStatus::Unresolved { reason },
            provider: None,
            staleness: None,
            attempts,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == FieldStatus::Resolved
    }

    pub fn unresolved_reason(&self) -> Option<UnresolvedReason> {
        match self.status {
            FieldStatus::Unresolved { reason } => Some(reason),
            FieldStatus::Resolved => None,
        }
    }
}

/// Merged result of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub request_id: Uuid,
    pub media_type: String,
    pub query: String,
    pub fields: BTreeMap<String, FieldResult>,
    pub elapsed_ms: u64,
}

impl Resolution {
    pub fn field(&self, field: &str) -> Option<&FieldResult> {
        self.fields.get(field)
    }

    /// Resolved value of a field
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|r| r.value.as_ref())
    }
}

// ============================================================================
// Merger
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergerConfig {
    pub max_concurrent_fields: usize,
    /// TTL when neither field nor provider declares one
    pub default_ttl: Duration,
    pub stale_while_revalidate: bool,
    /// Deadline for background stale refreshes
    pub refresh_timeout: Duration,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fields: 8,
            default_ttl: Duration::from_secs(86_400),
            stale_while_revalidate: false,
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

enum CandidateOutcome {
    Accepted { value: Value, staleness: Staleness },
    Next,
    Halt(UnresolvedReason),
}

/// What the cache knows about a candidate for one field
enum CachedAnswer {
    Value { value: Value, staleness: Staleness },
    /// The provider answered this query recently without the field
    Empty,
}

pub struct ResultMerger {
    planner: FieldPlanner,
    scheduler: Arc<ExecutionScheduler>,
    cache: Arc<ResponseCache>,
    registry: Arc<ProviderRegistry>,
    config: MergerConfig,
}

impl ResultMerger {
    pub fn new(
        planner: FieldPlanner,
        scheduler: Arc<ExecutionScheduler>,
        cache: Arc<ResponseCache>,
        registry: Arc<ProviderRegistry>,
        config: MergerConfig,
    ) -> Self {
        Self {
            planner,
            scheduler,
            cache,
            registry,
            config,
        }
    }

    pub fn planner(&self) -> &FieldPlanner {
        &self.planner
    }

    /// Resolve every requested field
    pub async fn resolve(&self, request: &ResolutionRequest) -> Resolution {
        let started = Instant::now();
        let fields: BTreeSet<String> = request.fields.iter().cloned().collect();

        debug!(
            request_id = %request.request_id,
            media_type = %request.media_type,
            query = %request.query,
            fields = fields.len(),
            "Resolving"
        );

        let results: Vec<FieldResult> = stream::iter(fields)
            .map(|field| self.resolve_field(request, field))
            .buffer_unordered(self.config.max_concurrent_fields.max(1))
            .collect()
            .await;

        let resolved = results.iter().filter(|r| r.is_resolved()).count();
        let elapsed = started.elapsed();
        info!(
            request_id = %request.request_id,
            resolved,
            unresolved = results.len() - resolved,
            elapsed_ms = elapsed.as_millis() as u64,
            "Resolution complete"
        );

        Resolution {
            request_id: request.request_id,
            media_type: request.media_type.clone(),
            query: request.query.clone(),
            fields: results.into_iter().map(|r| (r.field.clone(), r)).collect(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    async fn resolve_field(&self, request: &ResolutionRequest, field: String) -> FieldResult {
        let plan = self.planner.plan(&request.media_type, &field);
        let mut attempts = Vec::new();

        if plan.is_empty() {
            debug!(
                request_id = %request.request_id,
                field = %field,
                "No provider available"
            );
            return FieldResult::unresolved(field, UnresolvedReason::NoProviderAvailable, attempts);
        }

        for candidate in &plan {
            match self
                .try_candidate(request, &field, candidate, &mut attempts)
                .await
            {
                CandidateOutcome::Accepted { value, staleness } => {
                    return FieldResult::resolved(field, &candidate.provider, value, staleness, attempts);
                }
                CandidateOutcome::Next => continue,
                CandidateOutcome::Halt(reason) => {
                    debug!(
                        request_id = %request.request_id,
                        field = %field,
                        provider = %candidate.provider,
                        reason = ?reason,
                        "Field left unresolved"
                    );
                    return FieldResult::unresolved(field, reason, attempts);
                }
            }
        }

        FieldResult::unresolved(field, UnresolvedReason::Exhausted, attempts)
    }

    async fn try_candidate(
        &self,
        request: &ResolutionRequest,
        field: &str,
        candidate: &Candidate,
        attempts: &mut Vec<Attempt>,
    ) -> CandidateOutcome {
        let retries = candidate.fallback.retries();
        let mut tries = 0u32;

        loop {
            if request.cancel.is_cancelled() {
                return CandidateOutcome::Halt(UnresolvedReason::Cancelled);
            }
            if Instant::now() >= request.deadline {
                return CandidateOutcome::Halt(UnresolvedReason::Timeout);
            }

            if tries == 0 {
                match self.from_cache(request, field, candidate, attempts) {
                    Some(CachedAnswer::Value { value, staleness }) => {
                        return CandidateOutcome::Accepted { value, staleness };
                    }
                    // Retrying a cached answer cannot change it
                    Some(CachedAnswer::Empty) => {
                        return match candidate.fallback {
                            FallbackBehavior::Stop => CandidateOutcome::Halt(UnresolvedReason::Stopped),
                            FallbackBehavior::Continue | FallbackBehavior::Retry { .. } => CandidateOutcome::Next,
                        };
                    }
                    None => {}
                }
            }

            let report = self
                .scheduler
                .invoke(
                    &candidate.provider,
                    &request.media_type,
                    &request.query,
                    request.deadline,
                    &request.cancel,
                )
                .await;
            let version = report.version;
            let elapsed_ms = report.elapsed.as_millis() as u64;

            match report.result {
                Ok(payload) => {
                    write_through(
                        &self.cache,
                        &self.registry,
                        self.config.default_ttl,
                        &request.query,
                        &candidate.provider,
                        version,
                        &payload,
                    );
                    let value = payload.get(field).filter(|v| !is_empty_value(v)).cloned();
                    let outcome = if value.is_some() {
                        AttemptOutcome::Success
                    } else {
                        AttemptOutcome::Empty
                    };
                    attempts.push(Attempt {
                        provider: candidate.provider.clone(),
                        version,
                        outcome,
                        elapsed_ms,
                    });
                    if let Some(value) = value {
                        return CandidateOutcome::Accepted {
                            value,
                            staleness: Staleness::Fresh,
                        };
                    }
                }
                Err(e) => {
                    attempts.push(Attempt {
                        provider: candidate.provider.clone(),
                        version,
                        outcome: AttemptOutcome::Failed {
                            error: e.kind(),
                            message: e.to_string(),
                        },
                        elapsed_ms,
                    });
                    if request.cancel.is_cancelled() {
                        return CandidateOutcome::Halt(UnresolvedReason::Cancelled);
                    }
                    if Instant::now() >= request.deadline {
                        return CandidateOutcome::Halt(UnresolvedReason::Timeout);
                    }
                }
            }

            match candidate.fallback {
                FallbackBehavior::Continue => return CandidateOutcome::Next,
                FallbackBehavior::Stop => return CandidateOutcome::Halt(UnresolvedReason::Stopped),
                FallbackBehavior::Retry { .. } if tries < retries => {
                    tries += 1;
                    let wake = (Instant::now() + candidate.fallback.backoff()).min(request.deadline);
                    tokio::select! {
                        _ = request.cancel.cancelled() => {
                            return CandidateOutcome::Halt(UnresolvedReason::Cancelled);
                        }
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                FallbackBehavior::Retry { .. } => return CandidateOutcome::Next,
            }
        }
    }

    fn from_cache(
        &self,
        request: &ResolutionRequest,
        field: &str,
        candidate: &Candidate,
        attempts: &mut Vec<Attempt>,
    ) -> Option<CachedAnswer> {
        let key = CacheKey::new(&request.query, &candidate.provider, field);
        let (value, staleness, outcome) = match self.cache.lookup(&key) {
            CacheLookup::Fresh { value, age } => (
                value,
                Staleness::Cached {
                    age_ms: age.as_millis() as u64,
                },
                AttemptOutcome::CacheHit,
            ),
            CacheLookup::Stale { value, age } if self.config.stale_while_revalidate => {
                self.spawn_refresh(request, &candidate.provider, key);
                (
                    value,
                    Staleness::Stale {
                        age_ms: age.as_millis() as u64,
                    },
                    AttemptOutcome::StaleHit,
                )
            }
            CacheLookup::Stale { .. } | CacheLookup::Miss => {
                return self.from_whole_payload(request, field, candidate, attempts);
            }
        };

        attempts.push(Attempt {
            provider: candidate.provider.clone(),
            version: None,
            outcome,
            elapsed_ms: 0,
        });
        Some(CachedAnswer::Value { value, staleness })
    }

    /// Answer a field from the provider's last whole payload for the query
    fn from_whole_payload(
        &self,
        request: &ResolutionRequest,
        field: &str,
        candidate: &Candidate,
        attempts: &mut Vec<Attempt>,
    ) -> Option<CachedAnswer> {
        let (payload, age) = self
            .cache
            .get(&CacheKey::whole(&request.query, &candidate.provider))?;
        let value = payload.get(field).filter(|v| !is_empty_value(v)).cloned();

        attempts.push(Attempt {
            provider: candidate.provider.clone(),
            version: None,
            outcome: if value.is_some() {
                AttemptOutcome::CacheHit
            } else {
                AttemptOutcome::Empty
            },
            elapsed_ms: 0,
        });
        Some(match value {
            Some(value) => CachedAnswer::Value {
                value,
                staleness: Staleness::Cached {
                    age_ms: age.as_millis() as u64,
                },
            },
            None => CachedAnswer::Empty,
        })
    }

    /// Refresh a stale entry in the background, at most once per key
    fn spawn_refresh(&self, request: &ResolutionRequest, provider: &str, key: CacheKey) {
        if !self.cache.begin_refresh(&key) {
            return;
        }

        let scheduler = Arc::clone(&self.scheduler);
        let cache = Arc::clone(&self.cache);
        let registry = Arc::clone(&self.registry);
        let default_ttl = self.config.default_ttl;
        let deadline = Instant::now() + self.config.refresh_timeout;
        let media_type = request.media_type.clone();
        let query = request.query.clone();
        let provider = provider.to_string();

        tokio::spawn(async move {
            let report = scheduler
                .invoke(&provider, &media_type, &query, deadline, &CancellationToken::new())
                .await;
            match report.result {
                Ok(payload) => {
                    write_through(&cache, &registry, default_ttl, &query, &provider, report.version, &payload);
                    debug!(provider = %provider, query = %query, "Stale entry refreshed");
                }
                Err(e) => {
                    debug!(provider = %provider, query = %query, error = %e, "Stale refresh failed");
                }
            }
            cache.end_refresh(&key);
        });
    }
}

/// Cache every non-empty field of a payload plus the whole payload
///
/// The whole payload is cached even when empty so a provider with nothing
/// for the query is not asked again within its TTL. It expires with the
/// shortest TTL among its fields.
fn write_through(
    cache: &ResponseCache,
    registry: &ProviderRegistry,
    default_ttl: Duration,
    query: &str,
    provider: &str,
    version: Option<Version>,
    payload: &ProviderPayload,
) {
    let installed = registry.get(provider).ok().map(|slot| {
        version
            .and_then(|v| slot.version(v))
            .unwrap_or_else(|| slot.active())
    });
    let ttl_for = |field: &str| {
        installed
            .as_ref()
            .and_then(|i| i.descriptor.ttl_for(field))
            .unwrap_or(default_ttl)
    };

    let mut whole_ttl = ttl_for(WHOLE_PAYLOAD);
    for (field, value) in payload.fields() {
        let ttl = ttl_for(field);
        whole_ttl = whole_ttl.min(ttl);
        if !is_empty_value(value) {
            cache.put(CacheKey::new(query, provider, field.as_str()), value.clone(), ttl);
        }
    }
    cache.put(CacheKey::whole(query, provider), payload.to_value(), whole_ttl);
}
