//! Tool invocation router.
//!
//! Resolves a tool name to the server that owns it, checks the arguments
//! against the cached input schema, and forwards the call. Every outcome,
//! success or not, comes back as a [`ToolCallEnvelope`]; callers never see
//! a raw transport error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use mcphub_core::{Scope, ServerId, ToolArguments, ToolCallEnvelope, ToolDescriptor};
use tracing::{debug, info};

use crate::client::McpConnection;
use crate::error::{InvocationError, McpError};
use crate::protocol::{GetPromptResult, ReadResourceResult};
use crate::supervisor::Supervisor;

/// Routes tool calls to connected servers.
#[derive(Clone)]
pub struct Router {
    supervisor: Arc<Supervisor>,
    scope: Option<Scope>,
}

impl Router {
    /// Route across every scope.
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor, scope: None }
    }

    /// Only consider servers in `scope`.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Invoke a tool by name.
    pub async fn invoke(&self, tool: &str, arguments: ToolArguments) -> ToolCallEnvelope {
        let started = Instant::now();
        let envelope = match self.dispatch(tool, &arguments).await {
            Ok(envelope) => envelope,
            Err((server, e)) => {
                let envelope = ToolCallEnvelope::failure(tool, e.kind(), e.to_string());
                match server {
                    Some(server) => envelope.with_server(server),
                    None => envelope,
                }
            }
        };
        let envelope = envelope.with_duration(started.elapsed().as_millis() as u64);

        info!(
            tool = tool,
            success = envelope.success,
            duration_ms = envelope.duration_ms,
            "Tool call finished"
        );
        envelope
    }

    async fn dispatch(
        &self,
        tool: &str,
        arguments: &ToolArguments,
    ) -> Result<ToolCallEnvelope, (Option<ServerId>, InvocationError)> {
        let registry = self.supervisor.registry();
        let owner = match &self.scope {
            Some(scope) => registry.find_tool_owner_in(scope, tool),
            None => registry.find_tool_owner(tool),
        };
        let server = owner.ok_or_else(|| (None, InvocationError::UnknownTool(tool.to_string())))?;

        // The entry may vanish between lookup and here if the server drops.
        let capabilities = registry
            .get(server)
            .ok_or_else(|| (None, InvocationError::UnknownTool(tool.to_string())))?;
        let schema = capabilities
            .tool_schema(tool)
            .ok_or_else(|| (None, InvocationError::UnknownTool(tool.to_string())))?;

        arguments.validate(schema).map_err(|problems| {
            (
                Some(server),
                InvocationError::InvalidArguments {
                    tool: tool.to_string(),
                    problems,
                },
            )
        })?;

        let connection = self
            .supervisor
            .live_connection(server)
            .ok_or_else(|| (Some(server), InvocationError::ConnectionLost(capabilities.server_name.clone())))?;

        debug!(tool = tool, server = %capabilities.server_name, "Routing tool call");
        let result = connection
            .call_tool(tool, arguments.to_json())
            .await
            .map_err(|e| (Some(server), e))?;

        if result.is_error {
            let message = result
                .content
                .iter()
                .find_map(|c| c.as_text())
                .unwrap_or("tool reported an error")
                .to_string();
            let err = InvocationError::ToolFailed(message);
            return Ok(ToolCallEnvelope::failure(tool, err.kind(), err.to_string())
                .with_server(server)
                .with_content(result.content));
        }

        Ok(ToolCallEnvelope::success(tool, server, result.content))
    }

    /// Tools callable right now, one per name.
    pub fn list_available_tools(&self) -> Vec<ToolDescriptor> {
        self.supervisor.registry().list_tools(self.scope.as_ref())
    }

    /// Read a resource from a specific server.
    pub async fn read_resource(&self, server: ServerId, uri: &str) -> Result<ReadResourceResult, McpError> {
        let connection = self.connection(server)?;
        Ok(connection.read_resource(uri).await?)
    }

    /// Render a prompt from a specific server.
    pub async fn get_prompt(
        &self,
        server: ServerId,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let connection = self.connection(server)?;
        Ok(connection.get_prompt(name, arguments).await?)
    }

    fn connection(&self, server: ServerId) -> Result<Arc<McpConnection>, InvocationError> {
        self.supervisor
            .live_connection(server)
            .ok_or_else(|| InvocationError::ConnectionLost(server.to_string()))
    }
}
