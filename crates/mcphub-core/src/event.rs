//! Domain events published on lifecycle transitions.
//!
//! Events are fire-and-forget notifications for the chat-streaming layer and
//! any UI listeners. They are never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::server::{Scope, ServerId, ServerStatus};

/// Severity of an event, for subscribers that only care about problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Routine notification.
    Info,
    /// Something an operator should look at.
    Warning,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A server moved to a new lifecycle status.
    ServerStatusChanged {
        server_id: ServerId,
        server_name: String,
        status: ServerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A descriptor was created.
    ServerCreated { server_id: ServerId, server_name: String },
    /// A descriptor was updated (including enable/disable).
    ServerUpdated { server_id: ServerId, server_name: String },
    /// A descriptor was removed.
    ServerDeleted { server_id: ServerId, server_name: String },
    /// A server's capabilities were replaced.
    CapabilitiesRefreshed {
        server_id: ServerId,
        server_name: String,
        tools: usize,
        resources: usize,
        prompts: usize,
    },
    /// Two or more connected servers advertise the same tool name.
    DuplicateToolName {
        tool: String,
        servers: Vec<ServerId>,
        selected: ServerId,
    },
}

impl EventKind {
    /// Short type tag, matching the serialized `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerStatusChanged { .. } => "server_status_changed",
            Self::ServerCreated { .. } => "server_created",
            Self::ServerUpdated { .. } => "server_updated",
            Self::ServerDeleted { .. } => "server_deleted",
            Self::CapabilitiesRefreshed { .. } => "capabilities_refreshed",
            Self::DuplicateToolName { .. } => "duplicate_tool_name",
        }
    }

    /// The server this event is about, if it concerns exactly one.
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            Self::ServerStatusChanged { server_id, .. }
            | Self::ServerCreated { server_id, .. }
            | Self::ServerUpdated { server_id, .. }
            | Self::ServerDeleted { server_id, .. }
            | Self::CapabilitiesRefreshed { server_id, .. } => Some(*server_id),
            Self::DuplicateToolName { .. } => None,
        }
    }
}

/// A scoped, timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Scope tag so subscribers can filter cheaply.
    pub scope: Scope,
    /// Severity.
    pub level: EventLevel,
    /// Event payload.
    #[serde(flatten)]
    pub kind: EventKind,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Create an info-level event.
    pub fn new(scope: Scope, kind: EventKind) -> Self {
        Self {
            scope,
            level: EventLevel::Info,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Create a warning-level event.
    pub fn warning(scope: Scope, kind: EventKind) -> Self {
        Self {
            level: EventLevel::Warning,
            ..Self::new(scope, kind)
        }
    }

    /// Shorthand for a status change event.
    pub fn status_changed(
        scope: Scope,
        server_id: ServerId,
        server_name: impl Into<String>,
        status: ServerStatus,
        error: Option<String>,
    ) -> Self {
        Self::new(
            scope,
            EventKind::ServerStatusChanged {
                server_id,
                server_name: server_name.into(),
                status,
                error,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_serialization() {
        let id = ServerId::new();
        let event = DomainEvent::status_changed(Scope::new("alice"), id, "weather", ServerStatus::Connected, None);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["scope"], "alice");
        assert_eq!(json["type"], "server_status_changed");
        assert_eq!(json["status"], "connected");
        assert_eq!(json["level"], "info");
        assert!(json.get("error").is_none());
        assert_eq!(event.kind.name(), "server_status_changed");
        assert_eq!(event.kind.server_id(), Some(id));
    }

    #[test]
    fn test_duplicate_tool_is_warning() {
        let a = ServerId::new();
        let b = ServerId::new();
        let event = DomainEvent::warning(
            Scope::default(),
            EventKind::DuplicateToolName {
                tool: "search".to_string(),
                servers: vec![a, b],
                selected: b,
            },
        );
        assert_eq!(event.level, EventLevel::Warning);
        assert_eq!(event.kind.server_id(), None);

        let round: DomainEvent = serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();
        assert_eq!(round, event);
    }
}
