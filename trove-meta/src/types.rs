//! Core types shared across the engine
//!
//! Media types, field names and provider names are plain strings: the set of
//! media types ("movie", "tv", "book", ...) and fields ("title", "poster_url",
//! ...) is open-ended and defined by whatever providers declare.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Cache key field marker for a whole provider payload
pub const WHOLE_PAYLOAD: &str = "*";

/// Version of this engine, checked against plugin `min_engine_version`
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parsed [`ENGINE_VERSION`]
pub fn engine_version() -> Version {
    Version::from_str(ENGINE_VERSION).unwrap_or(Version::new(0, 0, 0))
}

/// True when a provider value carries no usable data
///
/// Null, blank strings, empty arrays and empty objects all count as empty;
/// numbers and booleans never do.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Semantic version (`major.minor.patch`)
///
/// Pre-release and build suffixes (`-beta.1`, `+abc`) are accepted on input
/// and ignored for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = |label: &str| -> Result<u64, String> {
            match parts.next() {
                Some(p) => p
                    .parse::<u64>()
                    .map_err(|_| format!("invalid {} component in version '{}'", label, s)),
                None => Ok(0),
            }
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;

        if parts.next().is_some() {
            return Err(format!("too many components in version '{}'", s));
        }
        if core.is_empty() {
            return Err("empty version".to_string());
        }

        Ok(Version::new(major, minor, patch))
    }
}

impl TryFrom<String> for Version {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}
