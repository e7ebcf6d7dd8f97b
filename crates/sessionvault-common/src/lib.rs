//! SessionVault Common - Shared types and utilities
//!
//! This crate provides the domain types, error definitions, configuration
//! and content hashing used across all SessionVault components.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHashError, content_checksum};
pub use types::*;
