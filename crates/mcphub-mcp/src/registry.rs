//! Capability registry.
//!
//! Caches the tools, resources and prompts of every connected server. Entries
//! are replaced wholesale, never merged. The map is sharded per key, so
//! lookups proceed while another server's entry is being written.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mcphub_core::{DomainEvent, EventKind, Scope, ServerId, ToolDescriptor};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::notifier::EventPublisher;
use crate::protocol::{McpPrompt, McpToolDefinition};

/// A resource or resource template advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    /// URI, or URI template when `template` is set.
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Whether `uri` is a template.
    pub template: bool,
}

/// Everything a server advertised during its last handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Capabilities {
    /// Name of the server.
    pub server_name: String,
    /// Owning scope of the server.
    pub scope: Scope,
    /// Tools.
    pub tools: Vec<McpToolDefinition>,
    /// Resources and resource templates.
    pub resources: Vec<ResourceInfo>,
    /// Prompts.
    pub prompts: Vec<McpPrompt>,
    /// Usage hints from the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Capabilities {
    /// Look up a tool by name.
    pub fn tool(&self, name: &str) -> Option<&McpToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Input schema of a tool.
    pub fn tool_schema(&self, name: &str) -> Option<&Value> {
        self.tool(name).map(|t| &t.input_schema)
    }
}

struct Entry {
    capabilities: Arc<Capabilities>,
    /// Connection order; higher is more recent.
    sequence: u64,
}

/// Per-server capability cache.
pub struct CapabilityRegistry {
    entries: DashMap<ServerId, Entry>,
    sequence: AtomicU64,
    /// Ambiguities already reported: tool name plus sorted owner set.
    reported: Mutex<HashSet<(String, Vec<ServerId>)>>,
    events: EventPublisher,
}

impl CapabilityRegistry {
    /// Create an empty registry that reports ambiguities through `events`.
    pub fn new(events: EventPublisher) -> Self {
        Self {
            entries: DashMap::new(),
            sequence: AtomicU64::new(0),
            reported: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Replace a server's capabilities.
    ///
    /// A server keeps its connection order across refreshes; only an entry
    /// created after [`invalidate`](Self::invalidate) counts as a newer
    /// connection.
    pub fn refresh(&self, server: ServerId, capabilities: Capabilities) {
        let capabilities = Arc::new(capabilities);
        let tool_names: Vec<String> = capabilities.tools.iter().map(|t| t.name.clone()).collect();

        self.entries
            .entry(server)
            .and_modify(|entry| entry.capabilities = Arc::clone(&capabilities))
            .or_insert_with(|| Entry {
                capabilities: Arc::clone(&capabilities),
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            });

        for name in tool_names {
            self.resolve(&name, None);
        }
    }

    /// Cached capabilities of a server.
    pub fn get(&self, server: ServerId) -> Option<Arc<Capabilities>> {
        self.entries.get(&server).map(|e| Arc::clone(&e.capabilities))
    }

    /// Drop a server's capabilities. Returns whether anything was cached.
    pub fn invalidate(&self, server: ServerId) -> bool {
        let removed = self.entries.remove(&server).is_some();
        if removed {
            self.reported.lock().retain(|(_, owners)| !owners.contains(&server));
        }
        removed
    }

    /// Server that owns `tool`, preferring the most recently connected one.
    pub fn find_tool_owner(&self, tool: &str) -> Option<ServerId> {
        self.resolve(tool, None)
    }

    /// Like [`find_tool_owner`](Self::find_tool_owner), restricted to one scope.
    pub fn find_tool_owner_in(&self, scope: &Scope, tool: &str) -> Option<ServerId> {
        self.resolve(tool, Some(scope))
    }

    /// Every tool of every cached server, one entry per name, sorted by name.
    pub fn list_tools(&self, scope: Option<&Scope>) -> Vec<ToolDescriptor> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| scope.map_or(true, |s| &e.capabilities.scope == s))
            .flat_map(|e| e.capabilities.tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>())
            .collect();
        names.sort();
        names.dedup();

        names
            .into_iter()
            .filter_map(|name| {
                let owner = self.resolve(&name, scope)?;
                let capabilities = self.get(owner)?;
                let tool = capabilities.tool(&name)?;
                Some(ToolDescriptor {
                    name: tool.name.clone(),
                    description: tool.description.clone().unwrap_or_default(),
                    schema: tool.input_schema.clone(),
                    server: capabilities.server_name.clone(),
                })
            })
            .collect()
    }

    /// Copy of every entry, for diagnostics.
    pub fn snapshot(&self) -> Vec<(ServerId, Arc<Capabilities>)> {
        let mut entries: Vec<(u64, ServerId, Arc<Capabilities>)> = self
            .entries
            .iter()
            .map(|e| (e.sequence, *e.key(), Arc::clone(&e.capabilities)))
            .collect();
        entries.sort_by_key(|(sequence, _, _)| *sequence);
        entries.into_iter().map(|(_, id, caps)| (id, caps)).collect()
    }

    /// Number of cached servers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve(&self, tool: &str, scope: Option<&Scope>) -> Option<ServerId> {
        let mut owners: Vec<(u64, ServerId, Scope)> = self
            .entries
            .iter()
            .filter(|e| scope.map_or(true, |s| &e.capabilities.scope == s))
            .filter(|e| e.capabilities.tool(tool).is_some())
            .map(|e| (e.sequence, *e.key(), e.capabilities.scope.clone()))
            .collect();

        owners.sort_by_key(|(sequence, _, _)| *sequence);
        let (_, selected, selected_scope) = owners.last().cloned()?;

        if owners.len() > 1 {
            let mut servers: Vec<ServerId> = owners.iter().map(|(_, id, _)| *id).collect();
            servers.sort();
            self.report_duplicate(tool, servers, selected, selected_scope);
        }

        Some(selected)
    }

    fn report_duplicate(&self, tool: &str, servers: Vec<ServerId>, selected: ServerId, scope: Scope) {
        let first_time = self.reported.lock().insert((tool.to_string(), servers.clone()));
        if !first_time {
            return;
        }

        warn!(
            tool = tool,
            servers = servers.len(),
            selected = %selected,
            "Tool advertised by more than one server; using the most recently connected"
        );
        self.events.publish(DomainEvent::warning(
            scope,
            EventKind::DuplicateToolName {
                tool: tool.to_string(),
                servers,
                selected,
            },
        ));
    }
}
