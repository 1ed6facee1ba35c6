//! # mcphub-mcp
//!
//! MCP (Model Context Protocol) connection management for mcphub.
//!
//! This crate provides:
//! - stdio, SSE and streamable HTTP transports
//! - JSON-RPC framing and the MCP handshake
//! - A capability registry shared by every connected server
//! - A connection supervisor with retries and health checks
//! - Tool routing and a chat tool loop
//! - Scoped lifecycle events

pub mod chat;
pub mod client;
pub mod error;
pub mod hub;
pub mod notifier;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use chat::{ChatModel, LoopEvent, LoopOutcome, ModelEvent, ToolLoop};
pub use client::McpConnection;
pub use error::{ConfigError, HandshakeError, InvocationError, McpError, TransportError};
pub use hub::Hub;
pub use notifier::{EventNotifier, EventPublisher};
pub use registry::{Capabilities, CapabilityRegistry};
pub use router::Router;
pub use supervisor::Supervisor;
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
