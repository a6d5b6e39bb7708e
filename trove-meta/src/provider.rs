//! Metadata provider interface
//!
//! Providers are stateless request/response components behind a fixed method
//! set. Everything stateful (caching, health, rate limits) lives in the
//! engine; a provider only turns a query into a field payload.

use crate::settings::{ProviderSettings, SettingsSchema};
use crate::types::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One (media type, fields, default priority) capability declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub media_type: String,
    pub fields: Vec<String>,
    pub default_priority: i32,
}

impl Capability {
    pub fn new<I, S>(media_type: impl Into<String>, fields: I, default_priority: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            media_type: media_type.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            default_priority,
        }
    }
}

/// Provider capability descriptor, consumed at registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub name: String,
    pub version: Version,
    /// Calls per minute; 0 means unlimited
    #[serde(default)]
    pub rate_limit_per_minute: u32,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub min_engine_version: Option<Version>,
    /// Provider-wide cache TTL override
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// Per-field cache TTL overrides
    #[serde(default)]
    pub field_ttl_secs: BTreeMap<String, u64>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            rate_limit_per_minute: 0,
            capabilities: Vec::new(),
            min_engine_version: None,
            cache_ttl_secs: None,
            field_ttl_secs: BTreeMap::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_field_ttl(mut self, field: impl Into<String>, ttl: Duration) -> Self {
        self.field_ttl_secs.insert(field.into(), ttl.as_secs());
        self
    }

    pub fn with_min_engine_version(mut self, version: Version) -> Self {
        self.min_engine_version = Some(version);
        self
    }

    /// Does this provider declare `field` for `media_type`?
    pub fn supports(&self, media_type: &str, field: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.media_type == media_type && c.fields.iter().any(|f| f == field))
    }

    /// Every declared (media type, field, default priority) triple, in declaration order
    pub fn declared_fields(&self) -> impl Iterator<Item = (&str, &str, i32)> {
        self.capabilities.iter().flat_map(|c| {
            c.fields
                .iter()
                .map(move |f| (c.media_type.as_str(), f.as_str(), c.default_priority))
        })
    }

    /// Cache TTL for `field`: field override, then provider override
    pub fn ttl_for(&self, field: &str) -> Option<Duration> {
        self.field_ttl_secs
            .get(field)
            .or(self.cache_ttl_secs.as_ref())
            .map(|secs| Duration::from_secs(*secs))
    }
}

/// Field payload returned by a provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderPayload {
    fields: BTreeMap<String, Value>,
}

impl ProviderPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whole payload as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Everything a provider receives for one call
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub media_type: String,
    /// Stable query key: external id or free text
    pub query: String,
    /// Schema-validated settings with defaults applied
    pub settings: Arc<ProviderSettings>,
    /// Cancelled when the call is abandoned (deadline or request cancel)
    pub cancel: CancellationToken,
}

/// Errors a provider reports for one call
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Upstream answered with something unusable
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Upstream has no record for the query (not a health failure)
    #[error("not found")]
    NotFound,

    /// Provider observed cancellation and stopped
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Metadata provider implementation
///
/// # Example
/// ```rust,ignore
/// struct Tmdb { descriptor: ProviderDescriptor }
///
/// #[async_trait::async_trait]
/// impl MetadataProvider for Tmdb {
///     fn descriptor(&self) -> &ProviderDescriptor { &self.descriptor }
///
///     async fn fetch(&self, call: &ProviderCall) -> Result<ProviderPayload, ProviderError> {
///         let movie = lookup(&call.query, &call.settings).await?;
///         Ok(ProviderPayload::new().with("title", json!(movie.title)))
///     }
/// }
/// ```
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Capability descriptor for this implementation
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Settings this provider accepts
    fn settings_schema(&self) -> SettingsSchema {
        SettingsSchema::default()
    }

    /// Fetch metadata for a query
    async fn fetch(&self, call: &ProviderCall) -> Result<ProviderPayload, ProviderError>;

    /// Lightweight capability check used after hot updates
    async fn probe(&self, _settings: &ProviderSettings) -> Result<(), ProviderError> {
        Ok(())
    }
}
