//! Error types for pinflow.
//!
//! Errors carry a stable machine code so the launcher, the worker and the
//! telemetry stream can all report failures in the same shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for pinflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// pinflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing dependency source, missing marker token, empty code.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to fetch workflow dependency '{dependency}': {message}")]
    Fetch { dependency: String, message: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Fetch { .. } => "FETCH_ERROR",
            Error::Template(_) => "TEMPLATE_ERROR",
            Error::Node(_) => "NODE_ERROR",
            Error::Script(_) => "SCRIPT_ERROR",
            Error::Channel(_) => "CHANNEL_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error stops the runtime before the worker is started.
    pub fn is_fatal_before_start(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Fetch { .. })
    }

    /// Snapshot of the error as it travels inside a `failed` execution event.
    pub fn to_snapshot(&self) -> ErrorSnapshot {
        ErrorSnapshot {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serializable copy of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub code: String,
    pub message: String,
}
