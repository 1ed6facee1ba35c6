//! Server descriptors and connection state.
//!
//! A [`ServerDescriptor`] is the persisted description of one MCP server:
//! who owns it, how to reach it, how to authenticate, and how patient to be
//! with it. A [`ConnectionState`] is the supervisor's live view of that
//! server and is never persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ValidationResult;

/// Name of the protected memory tool server.
pub const MEMORY_SERVER: &str = "memory";

/// Name of the protected dynamic API tool server.
pub const DYNAMIC_API_SERVER: &str = "dynamic-mcp-api";

/// Server names that can never be deleted or renamed.
pub const PROTECTED_SERVERS: [&str; 2] = [MEMORY_SERVER, DYNAMIC_API_SERVER];

/// Check whether a server name is protected.
pub fn is_protected_name(name: &str) -> bool {
    PROTECTED_SERVERS.contains(&name)
}

/// Unique identifier of a configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(Uuid);

impl ServerId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Owning scope of a server (typically a user id).
///
/// Server names are unique within a scope, and events are published on a
/// per-scope topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    /// Create a scope from any string-like value.
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    /// Get the scope as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Wire transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local subprocess speaking line-delimited JSON over stdin/stdout.
    Stdio,
    /// Server-Sent-Events stream plus POSTed requests.
    Sse,
    /// Session-oriented streamable HTTP.
    StreamableHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
            Self::StreamableHttp => write!(f, "streamable_http"),
        }
    }
}

/// Transport parameters, one variant per [`TransportKind`].
///
/// Maps are ordered so that serialized descriptors are stable byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a local process.
    Stdio {
        /// Command to execute (e.g., "npx" or "/path/to/server").
        command: String,
        /// Command arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables for the child.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Working directory for the child.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
    },
    /// Connect to an SSE endpoint.
    Sse {
        /// Stream URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Connect to a streamable HTTP endpoint.
    StreamableHttp {
        /// Endpoint URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    /// Get the transport kind.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }

    /// Short human-readable target (command line or URL).
    pub fn target(&self) -> String {
        match self {
            Self::Stdio { command, args, .. } if args.is_empty() => command.clone(),
            Self::Stdio { command, args, .. } => format!("{} {}", command, args.join(" ")),
            Self::Sse { url, .. } | Self::StreamableHttp { url, .. } => url.clone(),
        }
    }
}

/// Authentication descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,
    /// OAuth 2.0; tokens are issued elsewhere and stored here.
    #[serde(rename = "oauth")]
    OAuth {
        /// OAuth client id.
        client_id: String,
        /// OAuth client secret, if the client is confidential.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        /// Token endpoint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_url: Option<String>,
        /// Requested scopes.
        #[serde(default)]
        scopes: Vec<String>,
        /// Current access token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        /// Refresh token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
    /// Static API key sent in a header (HTTP) or exported to the child (stdio).
    ApiKey {
        /// The key itself.
        key: String,
        /// Header name; defaults to `X-API-Key`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        /// Environment variable to export for stdio servers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_var: Option<String>,
    },
    /// Static bearer token.
    Bearer {
        /// The token.
        token: String,
    },
}

impl AuthConfig {
    /// Short label used in listings. Never includes credentials.
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OAuth { .. } => "oauth",
            Self::ApiKey { .. } => "api_key",
            Self::Bearer { .. } => "bearer",
        }
    }
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

/// Per-server timeout and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Bound for connect, handshake and each tool call, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Automatic retries after a failed connect before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ConnectionSettings {
    /// Connection timeout as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Persisted description of one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique id.
    #[serde(default)]
    pub id: ServerId,
    /// Owning scope.
    #[serde(default)]
    pub scope: Scope,
    /// Name, unique within the scope.
    pub name: String,
    /// Transport parameters.
    pub transport: TransportConfig,
    /// Authentication descriptor.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Timeout and retry settings.
    #[serde(default)]
    pub settings: ConnectionSettings,
    /// Whether the server may be connected at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether to connect on startup and after enabling.
    #[serde(default)]
    pub auto_connect: bool,
    /// Administrative version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Administrative description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last update time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ServerDescriptor {
    /// Create a descriptor with the given transport and default settings.
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        let now = Utc::now();
        Self {
            id: ServerId::new(),
            scope: Scope::default(),
            name: name.into(),
            transport,
            auth: AuthConfig::None,
            settings: ConnectionSettings::default(),
            enabled: true,
            auto_connect: false,
            version: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a subprocess descriptor.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
                working_dir: None,
            },
        )
    }

    /// Create an SSE descriptor.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportConfig::Sse {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        )
    }

    /// Create a streamable HTTP descriptor.
    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportConfig::StreamableHttp {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        )
    }

    /// Set the arguments (stdio only; ignored otherwise).
    pub fn with_args(mut self, new_args: Vec<String>) -> Self {
        if let TransportConfig::Stdio { args, .. } = &mut self.transport {
            *args = new_args;
        }
        self
    }

    /// Add an environment variable (stdio only; ignored otherwise).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Add a request header (HTTP transports only; ignored otherwise).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.transport {
            TransportConfig::Sse { headers, .. } | TransportConfig::StreamableHttp { headers, .. } => {
                headers.insert(key.into(), value.into());
            }
            TransportConfig::Stdio { .. } => {}
        }
        self
    }

    /// Set the owning scope.
    pub fn with_scope(mut self, scope: impl Into<Scope>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Set the authentication descriptor.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Set the maximum number of automatic retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.settings.max_retries = max_retries;
        self
    }

    /// Set the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set whether the server is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set whether the server connects automatically.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whether this descriptor names a protected server.
    pub fn is_protected(&self) -> bool {
        is_protected_name(&self.name)
    }

    /// Validate the descriptor.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.name.is_empty() {
            result.add_error("name", "Server name cannot be empty");
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            result.add_error(
                "name",
                format!("Invalid server name '{}': use letters, digits, '-', '_' or '.'", self.name),
            );
        }

        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    result.add_error("transport.command", "Command cannot be empty");
                }
            }
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    result.add_error("transport.url", "url must start with http:// or https://");
                }
            }
        }

        if self.settings.connection_timeout_ms == 0 {
            result.add_error("settings.connection_timeout_ms", "connection timeout must be greater than 0");
        }

        if self.settings.max_retries > 20 {
            result.add_warning("settings.max_retries", "max_retries is very high (> 20)");
        }

        match &self.auth {
            AuthConfig::ApiKey { key, .. } if key.is_empty() => {
                result.add_error("auth.key", "API key cannot be empty");
            }
            AuthConfig::Bearer { token } if token.is_empty() => {
                result.add_error("auth.token", "Bearer token cannot be empty");
            }
            AuthConfig::OAuth { client_id, .. } if client_id.is_empty() => {
                result.add_error("auth.client_id", "OAuth client id cannot be empty");
            }
            _ => {}
        }

        result
    }
}

/// Lifecycle status of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Not connected (initial state).
    #[default]
    Disconnected,
    /// Transport is being opened or the handshake is in progress.
    Connecting,
    /// Handshake completed; capabilities are cached.
    Connected,
    /// Last connect or health check failed.
    Error,
    /// Disabled by an operator; no automatic retries.
    Disabled,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Live connection state of one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current lifecycle status.
    pub status: ServerStatus,
    /// When the server last completed a handshake.
    pub last_connected: Option<DateTime<Utc>>,
    /// Last recorded error.
    pub last_error: Option<String>,
    /// Automatic retries consumed since the last success or manual reconnect.
    pub retry_count: u32,
}

impl ConnectionState {
    /// Initial state for a newly registered descriptor.
    pub fn for_descriptor(descriptor: &ServerDescriptor) -> Self {
        Self {
            status: if descriptor.enabled {
                ServerStatus::Disconnected
            } else {
                ServerStatus::Disabled
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let descriptor = ServerDescriptor::stdio("weather", "npx")
            .with_args(vec!["-y".to_string(), "weather-mcp".to_string()])
            .with_env("API_REGION", "eu")
            .with_max_retries(5)
            .with_auto_connect(true);

        assert_eq!(descriptor.name, "weather");
        assert_eq!(descriptor.transport.kind(), TransportKind::Stdio);
        assert_eq!(descriptor.transport.target(), "npx -y weather-mcp");
        assert_eq!(descriptor.settings.max_retries, 5);
        assert!(descriptor.auto_connect);
        assert!(descriptor.enabled);
    }

    #[test]
    fn test_header_ignored_for_stdio() {
        let descriptor = ServerDescriptor::stdio("local", "cat").with_header("X-Test", "1");
        assert!(matches!(descriptor.transport, TransportConfig::Stdio { .. }));

        let descriptor = ServerDescriptor::sse("remote", "https://example.com/sse").with_header("X-Test", "1");
        match descriptor.transport {
            TransportConfig::Sse { headers, .. } => assert_eq!(headers.get("X-Test").map(String::as_str), Some("1")),
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[test]
    fn test_protected_names() {
        assert!(is_protected_name("memory"));
        assert!(is_protected_name("dynamic-mcp-api"));
        assert!(!is_protected_name("weather"));
        assert!(ServerDescriptor::stdio("memory", "npx").is_protected());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let descriptor = ServerDescriptor::sse("bad name", "ftp://nope");
        let result = descriptor.validate();
        assert!(!result.is_ok());
        assert!(result.errors().iter().any(|e| e.field == "name"));
        assert!(result.errors().iter().any(|e| e.field == "transport.url"));

        let descriptor = ServerDescriptor::stdio("ok", "cat").with_auth(AuthConfig::Bearer { token: String::new() });
        assert!(result_has(&descriptor.validate(), "auth.token"));
    }

    fn result_has(result: &ValidationResult, field: &str) -> bool {
        result.errors().iter().any(|e| e.field == field)
    }

    #[test]
    fn test_transport_serialization_shape() {
        let descriptor = ServerDescriptor::streamable_http("api", "https://example.com/mcp")
            .with_auth(AuthConfig::ApiKey {
                key: "secret".to_string(),
                header: None,
                env_var: None,
            });

        let transport = serde_json::to_value(&descriptor.transport).unwrap();
        assert_eq!(transport["type"], "streamable_http");
        assert_eq!(transport["url"], "https://example.com/mcp");

        let auth = serde_json::to_value(&descriptor.auth).unwrap();
        assert_eq!(auth["type"], "api_key");
        assert!(auth.get("header").is_none());
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let json = r#"{
            "name": "files",
            "transport": {"type": "stdio", "command": "cat"}
        }"#;
        let descriptor: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.scope, Scope::default());
        assert_eq!(descriptor.auth, AuthConfig::None);
        assert_eq!(descriptor.settings, ConnectionSettings::default());
        assert!(descriptor.enabled);
        assert!(!descriptor.auto_connect);
    }

    #[test]
    fn test_initial_state_follows_enablement() {
        let enabled = ServerDescriptor::stdio("a", "cat");
        let disabled = ServerDescriptor::stdio("b", "cat").with_enabled(false);
        assert_eq!(ConnectionState::for_descriptor(&enabled).status, ServerStatus::Disconnected);
        assert_eq!(ConnectionState::for_descriptor(&disabled).status, ServerStatus::Disabled);
    }

    #[test]
    fn test_server_id_parse() {
        let id = ServerId::new();
        let parsed: ServerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ServerId>().is_err());
    }
}
