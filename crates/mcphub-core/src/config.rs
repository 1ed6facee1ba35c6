//! Configuration system for mcphub.
//!
//! Configuration is an explicit value: load it once with [`Config::load`]
//! (or build one in code) and hand it to whatever needs it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::server::{
    is_protected_name, Scope, ServerDescriptor, TransportConfig, DYNAMIC_API_SERVER, MEMORY_SERVER,
};

/// Main configuration struct for mcphub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Connection supervisor settings
    pub supervisor: SupervisorConfig,
    /// Transport parameters for the protected servers
    pub protected: ProtectedServersConfig,
    /// Server store settings
    pub store: StoreConfig,
    /// Seed servers imported on first start
    pub servers: Vec<ServerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Scope used when none is given
    pub scope: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            scope: "default".to_string(),
        }
    }
}

impl GeneralConfig {
    /// The default scope as a [`Scope`].
    pub fn default_scope(&self) -> Scope {
        Scope::new(self.scope.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds between health-check pings of a connected server
    pub health_check_interval_secs: u64,
    /// First retry delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Upper bound for the retry delay in milliseconds
    pub retry_max_delay_ms: u64,
    /// Grace period for a subprocess to exit after SIGTERM, in milliseconds
    pub shutdown_grace_ms: u64,
    /// Connection timeout for servers created without one, in milliseconds
    pub connection_timeout_ms: u64,
    /// Retry budget for servers created without one
    pub max_retries: u32,
    /// Per-scope event buffer; slow subscribers lag beyond this
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            shutdown_grace_ms: 2_000,
            connection_timeout_ms: 30_000,
            max_retries: 3,
            event_buffer: 256,
        }
    }
}

impl SupervisorConfig {
    /// Health-check interval as a [`Duration`].
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Retry base delay as a [`Duration`].
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry maximum delay as a [`Duration`].
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `min(base * 2^(attempt-1), max)`; attempt 0 means no delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(30);
        let candidate = self.retry_base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(candidate.min(self.retry_max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectedServersConfig {
    /// Transport for the memory server
    pub memory: TransportConfig,
    /// Transport for the dynamic API server
    pub dynamic_api: TransportConfig,
    /// Whether the protected servers connect on startup
    pub auto_connect: bool,
}

impl Default for ProtectedServersConfig {
    fn default() -> Self {
        Self {
            memory: TransportConfig::Stdio {
                command: "npx".to_string(),
                args: vec!["-y".to_string(), "@modelcontextprotocol/server-memory".to_string()],
                env: BTreeMap::new(),
                working_dir: None,
            },
            dynamic_api: TransportConfig::StreamableHttp {
                url: "http://127.0.0.1:3001/mcp".to_string(),
                headers: BTreeMap::new(),
            },
            auto_connect: false,
        }
    }
}

impl ProtectedServersConfig {
    /// Descriptors for the protected servers in the given scope.
    pub fn descriptors(&self, scope: &Scope) -> Vec<ServerDescriptor> {
        vec![
            ServerDescriptor::new(MEMORY_SERVER, self.memory.clone())
                .with_scope(scope.clone())
                .with_auto_connect(self.auto_connect)
                .with_description("Knowledge-graph memory tool server"),
            ServerDescriptor::new(DYNAMIC_API_SERVER, self.dynamic_api.clone())
                .with_scope(scope.clone())
                .with_auto_connect(self.auto_connect)
                .with_description("Dynamic API tool server"),
        ]
    }
}

/// Storage backend for server descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Keep descriptors in memory only.
    Memory,
    /// Persist descriptors to SQLite.
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend to use
    pub backend: StoreBackend,
    /// Database path (defaults to the data directory)
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path.
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("servers.db"))
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Merge another result, prefixing its field paths.
    pub fn merge(&mut self, prefix: &str, other: ValidationResult) {
        for mut issue in other.issues {
            issue.field = format!("{}.{}", prefix, issue.field);
            self.issues.push(issue);
        }
    }

    /// Convert into an error listing every error-level issue.
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_ok() {
            return Ok(());
        }
        let errors: Vec<String> = self
            .errors()
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        Err(Error::Validation(errors.join("; ")))
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "supervisor.retry_base_delay_ms")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Build the figment used by [`Config::load`].
    pub fn figment() -> Figment {
        Figment::new()
            // Default values
            .merge(Serialized::defaults(Config::default()))
            // User config
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            // Project config
            .merge(Toml::file(".mcphub/config.toml"))
            // Environment variables, e.g. MCPHUB_SUPERVISOR__MAX_RETRIES=5
            .merge(Env::prefixed("MCPHUB_").split("__"))
    }

    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Load configuration from an explicit file on top of the defaults.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.into()))
            .merge(Env::prefixed("MCPHUB_").split("__"))
            .extract()
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Validate, logging warnings and failing on errors.
    pub fn check(&self) -> Result<(), Error> {
        let result = self.validate();
        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }
        result.into_result().map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.general.scope.is_empty() {
            result.add_error("general.scope", "Default scope cannot be empty");
        }

        let supervisor = &self.supervisor;
        if supervisor.health_check_interval_secs == 0 {
            result.add_error("supervisor.health_check_interval_secs", "must be greater than 0");
        }
        if supervisor.retry_base_delay_ms == 0 {
            result.add_error("supervisor.retry_base_delay_ms", "must be greater than 0");
        }
        if supervisor.retry_max_delay_ms < supervisor.retry_base_delay_ms {
            result.add_error(
                "supervisor.retry_max_delay_ms",
                "must be greater than or equal to retry_base_delay_ms",
            );
        }
        if supervisor.connection_timeout_ms == 0 {
            result.add_error("supervisor.connection_timeout_ms", "must be greater than 0");
        }
        if supervisor.event_buffer == 0 {
            result.add_error("supervisor.event_buffer", "must be greater than 0");
        }
        if supervisor.health_check_interval_secs > 3_600 {
            result.add_warning(
                "supervisor.health_check_interval_secs",
                "health checks less than hourly will detect dead servers late",
            );
        }

        let scope = self.general.default_scope();
        for protected in self.protected.descriptors(&scope) {
            let field = if protected.name == MEMORY_SERVER {
                "protected.memory"
            } else {
                "protected.dynamic_api"
            };
            let mut issues = protected.validate();
            issues.issues.retain(|i| i.field.starts_with("transport"));
            result.merge(field, issues);
        }

        let mut seen = std::collections::HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            let prefix = format!("servers[{}]", index);
            result.merge(&prefix, server.validate());

            if is_protected_name(&server.name) {
                result.add_error(
                    format!("{}.name", prefix),
                    format!("'{}' is reserved; configure it under [protected]", server.name),
                );
            }
            if !seen.insert((server.scope.clone(), server.name.clone())) {
                result.add_error(
                    format!("{}.name", prefix),
                    format!("duplicate server name '{}' in scope '{}'", server.name, server.scope),
                );
            }
        }

        result
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("mcphub"))
            .unwrap_or_else(|| PathBuf::from("~/.config/mcphub"))
    }

    /// Get the data directory (for the server database).
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|p| p.join("mcphub"))
            .unwrap_or_else(|| PathBuf::from("~/.local/share/mcphub"))
    }
}
