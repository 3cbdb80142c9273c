//! Error types for the Toolgate core library.

use thiserror::Error;

/// Result type alias using the Toolgate core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Toolgate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A line from the agent was not a valid frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
