//! # Trove metadata engine
//!
//! Field-level metadata resolution across independently versioned,
//! independently failing providers:
//! - per-field priority with fallback policies
//! - per-provider rate limits, concurrency bounds and circuit breakers
//! - response caching with TTLs and optional stale-while-revalidate
//! - hot update and rollback of provider implementations

pub mod artifact;
pub mod cache;
pub mod engine;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod manifest;
pub mod merger;
pub mod planner;
pub mod priority;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod types;

pub use engine::{MetadataEngine, MetadataEngineBuilder, ProviderInfo};
pub use error::{EngineError, FailureKind, Result};
pub use merger::{FieldResult, Resolution, ResolutionRequest, UnresolvedReason};
pub use priority::FallbackBehavior;
pub use provider::{
    Capability, MetadataProvider, ProviderCall, ProviderDescriptor, ProviderError, ProviderPayload,
};
pub use types::Version;
