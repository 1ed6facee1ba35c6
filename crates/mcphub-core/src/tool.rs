//! Tool definitions, arguments and call envelopes.
//!
//! Tool arguments are modelled as an open map of [`ArgValue`]s rather than
//! an opaque JSON blob, so they can be checked against a tool's input schema
//! before anything is sent to a server.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::ErrorKind;
use crate::server::ServerId;

/// A single argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ArgValue {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integral number.
    Integer(i64),
    /// Non-integral (or out of i64 range) number.
    Float(f64),
    /// String.
    String(String),
    /// Array of values.
    Array(Vec<ArgValue>),
    /// Nested object.
    Object(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    /// JSON-Schema type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// Check the value against a JSON-Schema `type` name.
    pub fn matches_type(&self, expected: &str) -> bool {
        match (expected, self) {
            ("null", Self::Null)
            | ("boolean", Self::Bool(_))
            | ("string", Self::String(_))
            | ("array", Self::Array(_))
            | ("object", Self::Object(_))
            | ("integer", Self::Integer(_))
            | ("number", Self::Integer(_) | Self::Float(_)) => true,
            ("integer", Self::Float(f)) => f.fract() == 0.0,
            _ => false,
        }
    }

    /// Get the string if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<ArgValue> for Value {
    fn from(value: ArgValue) -> Self {
        match value {
            ArgValue::Null => Value::Null,
            ArgValue::Bool(b) => Value::Bool(b),
            ArgValue::Integer(i) => Value::Number(i.into()),
            ArgValue::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            ArgValue::String(s) => Value::String(s),
            ArgValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            ArgValue::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for ArgValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Arguments of a tool call: an open map of named values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArguments(BTreeMap<String, ArgValue>);

impl ToolArguments {
    /// Create an empty argument map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build arguments from JSON. `null` is treated as "no arguments".
    pub fn from_json(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self(map.into_iter().map(|(k, v)| (k, ArgValue::from(v))).collect())),
            other => Err(format!("tool arguments must be a JSON object, got {}", json_type_name(&other))),
        }
    }

    /// Convert to a JSON object.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        Value::Object(map)
    }

    /// Add an argument.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert an argument.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up an argument.
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Validate against a tool input schema.
    ///
    /// Checks `required`, each declared property's `type` and `enum`, and
    /// `additionalProperties: false`. Keywords outside that set are ignored.
    /// Returns every violation found.
    pub fn validate(&self, schema: &Value) -> Result<(), Vec<String>> {
        let Some(schema) = schema.as_object() else {
            return Ok(());
        };

        let mut issues = Vec::new();
        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !self.0.contains_key(field) {
                    issues.push(format!("missing required field '{}'", field));
                }
            }
        }

        let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));

        for (name, value) in &self.0 {
            let Some(property) = properties.and_then(|p| p.get(name)) else {
                if closed {
                    issues.push(format!("unexpected field '{}'", name));
                }
                continue;
            };

            if let Some(expected) = property.get("type") {
                let allowed: Vec<&str> = match expected {
                    Value::String(t) => vec![t.as_str()],
                    Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
                    _ => Vec::new(),
                };
                if !allowed.is_empty() && !allowed.iter().any(|t| value.matches_type(t)) {
                    issues.push(format!(
                        "field '{}' expected {}, got {}",
                        name,
                        allowed.join(" | "),
                        value.type_name()
                    ));
                    continue;
                }
            }

            if let Some(options) = property.get("enum").and_then(Value::as_array) {
                let json = Value::from(value.clone());
                if !options.contains(&json) {
                    issues.push(format!("field '{}' must be one of {}", name, Value::Array(options.clone())));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A tool advertised to the chat pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as advertised by the server.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input.
    pub schema: Value,
    /// Name of the server that owns the tool.
    pub server: String,
}

/// Outbound tool call: `{ name, arguments }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCallRequest {
    /// Create a new tool call request.
    pub fn new(name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Embedded resource contents inside tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedResource {
    /// Resource URI.
    pub uri: String,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 binary contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Content returned by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
    /// Image content (base64 encoded).
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type of the image.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Audio content (base64 encoded).
    Audio {
        /// Base64-encoded audio data.
        data: String,
        /// MIME type of the audio.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource.
    Resource {
        /// The resource.
        resource: EmbeddedResource,
    },
    /// Content type this client does not understand.
    #[serde(other)]
    Unsupported,
}

impl ToolContent {
    /// Create a text content item.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get the text if this item carries any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Resource { resource } => resource.text.as_deref(),
            _ => None,
        }
    }
}

/// Normalized result of a tool call.
///
/// Transient: created per call and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEnvelope {
    /// Tool that was called.
    pub tool: String,
    /// Server that handled the call, when one was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerId>,
    /// Whether the call succeeded.
    pub success: bool,
    /// Structured content returned by the tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ToolContent>,
    /// Failure classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Human-readable failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall-clock duration of the call in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolCallEnvelope {
    /// Create a successful envelope.
    pub fn success(tool: impl Into<String>, server: ServerId, content: Vec<ToolContent>) -> Self {
        Self {
            tool: tool.into(),
            server: Some(server),
            success: true,
            content,
            error: None,
            message: None,
            duration_ms: 0,
        }
    }

    /// Create a failed envelope.
    pub fn failure(tool: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            server: None,
            success: false,
            content: Vec::new(),
            error: Some(kind),
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Attach the server that handled the call.
    pub fn with_server(mut self, server: ServerId) -> Self {
        self.server = Some(server);
        self
    }

    /// Attach tool output to a failure (tools may explain their own errors).
    pub fn with_content(mut self, content: Vec<ToolContent>) -> Self {
        self.content = content;
        self
    }

    /// Set the duration.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// All text content joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ToolContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text handed back to a model: the output on success, the error otherwise.
    pub fn model_text(&self) -> String {
        if self.success {
            return self.text();
        }
        let detail = self.text();
        let message = self.message.clone().unwrap_or_default();
        let kind = self.error.map(|k| k.to_string()).unwrap_or_else(|| "Error".to_string());
        match (message.is_empty(), detail.is_empty()) {
            (true, true) => kind,
            (false, true) => format!("{}: {}", kind, message),
            (true, false) => format!("{}: {}", kind, detail),
            (false, false) => format!("{}: {}\n{}", kind, message, detail),
        }
    }
}

impl fmt::Display for ToolCallEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(f, "{}", self.text())
        } else {
            write!(f, "{}", self.model_text())
        }
    }
}
