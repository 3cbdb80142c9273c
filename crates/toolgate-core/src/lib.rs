//! Toolgate Core Library
//!
//! Shared functionality for Toolgate components:
//! - NDJSON frame codec for the agent stream-json protocol
//! - Configuration resolution and hierarchy
//! - Permission modes and the static policy store
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod policy;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use policy::{PermissionMode, PolicyStore, StaticPolicy};
