//! # Trove Common Library
//!
//! Shared code for the Trove catalog services including:
//! - Common error type
//! - Bootstrap configuration loading (TOML) and logging initialisation
//! - Engine event types and the broadcast event bus
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
