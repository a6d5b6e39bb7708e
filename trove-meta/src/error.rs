//! Error types for the metadata engine
//!
//! Candidate-level failures (`ProviderUnavailable`, `ProviderTimeout`,
//! `ProviderInvalidResponse`, `RateLimitExceeded`, ...) are absorbed by the
//! result merger and only surface in attempt logs. Lifecycle and admin
//! failures are returned to the caller.

use crate::types::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    /// Circuit breaker is open for this provider
    #[error("Provider unavailable (circuit open): {provider}")]
    ProviderUnavailable { provider: String },

    /// Provider call exceeded its deadline
    #[error("Provider timed out: {provider}")]
    ProviderTimeout { provider: String },

    /// Provider returned a malformed payload
    #[error("Provider {provider} returned an invalid response: {reason}")]
    ProviderInvalidResponse { provider: String, reason: String },

    /// No rate-limit token became available before the deadline
    #[error("Rate limit exceeded for provider {provider}")]
    RateLimitExceeded { provider: String },

    /// Provider call failed (network, upstream error)
    #[error("Provider {provider} failed: {reason}")]
    ProviderFailed { provider: String, reason: String },

    /// Stored provider settings do not satisfy the provider's schema
    #[error("Invalid settings for provider {provider}: {reason}")]
    InvalidSettings { provider: String, reason: String },

    /// Call abandoned because the resolution request was cancelled
    #[error("Call to provider {provider} was cancelled")]
    Cancelled { provider: String },

    /// Staged artifact does not match its declared SHA-256
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Plugin requires a newer engine
    #[error("Provider {provider} requires engine {required}, running {engine}")]
    IncompatibleVersion {
        provider: String,
        required: Version,
        engine: Version,
    },

    /// Candidate list for a field was empty
    #[error("No provider available for {media_type}/{field}")]
    NoProviderAvailable { media_type: String, field: String },

    /// Update failed its health probe; the prior version was restored
    #[error("Update of {provider} to {attempted} rolled back to {restored}: {reason}")]
    UpdateRolledBack {
        provider: String,
        attempted: Version,
        restored: Version,
        reason: String,
    },

    /// Provider name+version already registered
    #[error("Provider {provider} {version} is already registered")]
    DuplicateProvider { provider: String, version: Version },

    /// No provider registered under this name
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// No retained version record for this provider/version
    #[error("Unknown version {version} for provider {provider}")]
    UnknownVersion { provider: String, version: Version },

    /// Operation not valid in the provider's current state
    #[error("Invalid state for provider {provider}: {reason}")]
    InvalidState { provider: String, reason: String },

    /// Another lifecycle operation holds this provider
    #[error("Lifecycle operation already in progress for provider {0}")]
    LifecycleBusy(String),

    /// Artifact could not be fetched, staged or loaded
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Update manifest could not be fetched or is malformed
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Persisted state surface failed
    #[error("State store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or other shared-library error
    #[error(transparent)]
    Common(#[from] trove_common::Error),
}

/// Serializable failure classification used in attempt logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProviderUnavailable,
    ProviderTimeout,
    ProviderInvalidResponse,
    RateLimitExceeded,
    ProviderFailed,
    InvalidSettings,
    Cancelled,
    Other,
}

impl EngineError {
    /// Classify this error for attempt logs
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::ProviderUnavailable { .. } => FailureKind::ProviderUnavailable,
            EngineError::ProviderTimeout { .. } => FailureKind::ProviderTimeout,
            EngineError::ProviderInvalidResponse { .. } => FailureKind::ProviderInvalidResponse,
            EngineError::RateLimitExceeded { .. } => FailureKind::RateLimitExceeded,
            EngineError::ProviderFailed { .. } => FailureKind::ProviderFailed,
            EngineError::InvalidSettings { .. } => FailureKind::InvalidSettings,
            EngineError::Cancelled { .. } => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}
