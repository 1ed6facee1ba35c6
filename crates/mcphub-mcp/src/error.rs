//! MCP-specific error types.
//!
//! The taxonomy follows the layer that fails: transports, the handshake,
//! tool invocation, and configuration changes. [`McpError`] wraps all four.

use mcphub_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Failed to spawn the child process, or it exited before speaking.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Streamable HTTP session is no longer valid; a fresh handshake is required.
    #[error("session expired")]
    SessionExpired,

    /// Transport was closed.
    #[error("transport closed")]
    Closed,

    /// Operation exceeded its bound.
    #[error("transport timed out after {0} ms")]
    Timeout(u64),

    /// Credentials were missing or refused at the transport layer.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    Write(String),

    /// HTTP-level failure other than the ones above.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The peer spoke something other than the expected framing.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Flat classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::Closed | Self::Write(_) => ErrorKind::Closed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::AuthRejected(_) => ErrorKind::AuthRejected,
            Self::Http(_) => ErrorKind::ConnectionLost,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(0);
        }
        if let Some(status) = e.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Self::AuthRejected(format!("HTTP {}", status));
            }
        }
        Self::Http(e.to_string())
    }
}

/// Errors raised while establishing a session with a server.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The transport could not be opened or failed mid-handshake.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A handshake or discovery reply did not match the expected schema.
    #[error("schema mismatch in {method}: {detail}")]
    SchemaMismatch { method: String, detail: String },

    /// Credentials were missing or refused.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The server answered a handshake request with a JSON-RPC error.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i32, message: String },

    /// The handshake did not finish in time.
    #[error("handshake timed out after {0} ms")]
    Timeout(u64),
}

impl HandshakeError {
    /// Create a schema mismatch error.
    pub fn schema(method: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            method: method.into(),
            detail: detail.into(),
        }
    }

    /// Flat classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::AuthRejected(_) => ErrorKind::AuthRejected,
            Self::ServerError { .. } => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Errors surfaced to callers of tool, resource and prompt operations.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// No connected server advertises the tool.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments failed schema validation.
    #[error("invalid arguments for {tool}: {}", problems.join("; "))]
    InvalidArguments { tool: String, problems: Vec<String> },

    /// The call did not complete in time.
    #[error("call timed out after {0} ms")]
    Timeout(u64),

    /// The connection went away while the call was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The server answered with a JSON-RPC error.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i32, message: String },

    /// The tool ran and reported a failure.
    #[error("tool failed: {0}")]
    ToolFailed(String),

    /// The server's reply could not be decoded.
    #[error("malformed reply: {0}")]
    Malformed(String),
}

impl InvocationError {
    /// Flat classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::ServerError { .. } | Self::ToolFailed(_) => ErrorKind::ToolFailed,
            Self::Malformed(_) => ErrorKind::Protocol,
        }
    }
}

impl From<TransportError> for InvocationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(ms) => Self::Timeout(ms),
            other => Self::ConnectionLost(other.to_string()),
        }
    }
}

/// Errors rejected synchronously when changing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A server with this name already exists in the scope.
    #[error("server '{name}' already exists in scope '{scope}'")]
    DuplicateName { scope: String, name: String },

    /// Operation not permitted on a protected server.
    #[error("server '{0}' is protected and cannot be deleted or renamed")]
    Protected(String),

    /// Name belongs to a protected server and cannot be taken by another.
    #[error("'{0}' is a reserved server name")]
    Reserved(String),

    /// No such server.
    #[error("server not found: {0}")]
    NotFound(String),

    /// Server is disabled.
    #[error("server '{0}' is disabled")]
    Disabled(String),

    /// Descriptor failed validation.
    #[error("invalid server descriptor: {0}")]
    Invalid(String),

    /// The configuration store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ConfigError {
    /// Flat classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateName { .. } => ErrorKind::DuplicateName,
            Self::Protected(_) | Self::Reserved(_) => ErrorKind::Protected,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::Invalid(_) => ErrorKind::Internal,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<mcphub_store::StoreError> for ConfigError {
    fn from(e: mcphub_store::StoreError) -> Self {
        use mcphub_store::StoreError;
        match e {
            StoreError::Duplicate { scope, name } => Self::DuplicateName { scope, name },
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake-level error.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Invocation-level error.
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Flat classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::Handshake(e) => e.kind(),
            Self::Invocation(e) => e.kind(),
            Self::Config(e) => e.kind(),
            Self::Json(_) => ErrorKind::Protocol,
        }
    }
}

impl From<McpError> for mcphub_core::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Config(ConfigError::Protected(name) | ConfigError::Reserved(name)) => {
                mcphub_core::Error::Protected(name)
            }
            McpError::Config(ConfigError::NotFound(name)) => mcphub_core::Error::NotFound(name),
            McpError::Config(ConfigError::Storage(msg)) => mcphub_core::Error::Storage(msg),
            McpError::Config(ConfigError::Invalid(msg)) => mcphub_core::Error::Validation(msg),
            other => mcphub_core::Error::Mcp(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "transport closed");
        assert_eq!(TransportError::SessionExpired.kind(), ErrorKind::SessionExpired);
    }

    #[test]
    fn test_handshake_kind_passes_through_transport() {
        let err = HandshakeError::from(TransportError::SpawnFailed("no such file".into()));
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
        assert_eq!(HandshakeError::schema("tools/list", "missing tools").kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_transport_failure_during_call_is_connection_lost() {
        let err = InvocationError::from(TransportError::Closed);
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        let err = InvocationError::from(TransportError::Timeout(500));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_invalid_arguments_display() {
        let err = InvocationError::InvalidArguments {
            tool: "get_forecast".to_string(),
            problems: vec!["missing required field 'city'".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "invalid arguments for get_forecast: missing required field 'city'"
        );
    }

    #[test]
    fn test_protected_maps_to_core_error() {
        let err = McpError::from(ConfigError::Protected("memory".to_string()));
        assert_eq!(err.kind(), ErrorKind::Protected);
        let core: mcphub_core::Error = err.into();
        assert!(matches!(core, mcphub_core::Error::Protected(_)));
    }
}
