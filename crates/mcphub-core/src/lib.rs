//! # mcphub-core
//!
//! Core types and abstractions for mcphub, the MCP tool-server hub.
//!
//! This crate provides:
//! - Server descriptors (transport and authentication parameters)
//! - Connection state and lifecycle status types
//! - Tool-call envelopes and schema-checkable argument values
//! - Domain events published on lifecycle transitions
//! - Chat message primitives used by the tool loop
//! - Configuration system
//! - Common error types

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod server;
pub mod tool;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use event::{DomainEvent, EventKind, EventLevel};
pub use message::{ChatMessage, RequestedToolCall, Role};
pub use server::{
    AuthConfig, ConnectionSettings, ConnectionState, Scope, ServerDescriptor, ServerId,
    ServerStatus, TransportConfig, TransportKind,
};
pub use tool::{ArgValue, ToolArguments, ToolCallEnvelope, ToolCallRequest, ToolContent, ToolDescriptor};
