//! Error types for mcphub.
//!
//! Crate-specific errors (transport, handshake, invocation, storage) convert
//! into this umbrella type at API boundaries that need a single error.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the mcphub [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mcphub.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// MCP error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation refused for a protected server
    #[error("Protected server: {0}")]
    Protected(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/mcphub/config.toml"),
            Error::Validation(_) => Some("Run 'mcphub check-config' to see every validation issue"),
            Error::NotFound(_) => Some("Use 'mcphub servers' to see configured servers"),
            Error::Protected(_) => Some("The memory and dynamic-mcp-api servers can be disabled but not removed"),
            Error::Storage(_) => Some("Check that the data directory is writable"),
            _ => None,
        }
    }
}

/// Flat classification of every failure the hub can report.
///
/// Carried in tool-call envelopes and events so that callers can branch on
/// the failure without matching nested error enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Subprocess could not be started or exited immediately.
    SpawnFailed,
    /// Streamable HTTP session is no longer known to the server.
    SessionExpired,
    /// Transport already closed.
    Closed,
    /// Operation exceeded its configured bound.
    Timeout,
    /// Handshake reply did not match the expected schema.
    SchemaMismatch,
    /// Server refused the credentials.
    AuthRejected,
    /// No connected server advertises the tool.
    UnknownTool,
    /// Arguments do not satisfy the tool's input schema.
    InvalidArguments,
    /// Connection went away while the call was in flight.
    ConnectionLost,
    /// The tool ran and reported a failure.
    ToolFailed,
    /// A server with this name already exists in the scope.
    DuplicateName,
    /// Operation not allowed on a protected server.
    Protected,
    /// Unknown server id or name.
    NotFound,
    /// Server is disabled.
    Disabled,
    /// Persistence collaborator failed.
    Storage,
    /// Malformed or unexpected protocol traffic.
    Protocol,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
