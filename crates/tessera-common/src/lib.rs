//! Tessera Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration and path types
//! used across all Tessera components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, EngineConfig, SyncMode};
pub use error::{Error, Result};
pub use types::*;
