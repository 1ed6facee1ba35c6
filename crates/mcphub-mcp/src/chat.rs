//! Chat tool loop.
//!
//! Interleaves model output with tool invocations: each round streams the
//! model's reply, runs the tools it asked for through the [`Router`], and
//! feeds the results back until the model answers without tool calls.
//!
//! ```text
//! ToolLoop
//!   ├─> ChatModel (stream of text / tool-call events)
//!   └─> Router (tool calls)
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use mcphub_core::{ChatMessage, ErrorKind, RequestedToolCall, ToolArguments, ToolCallEnvelope, ToolDescriptor};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::router::Router;

/// Rounds before the loop gives up on a model that keeps calling tools.
pub const DEFAULT_MAX_ROUNDS: usize = 10;

/// One event from a model stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A piece of assistant text.
    Text(String),
    /// The model wants a tool run.
    ToolCall(RequestedToolCall),
    /// The reply is complete.
    Done,
}

/// Failure reported by the model collaborator.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("model error: {0}")]
    Model(String),
}

/// Stream of model events for one round.
pub type ModelStream = BoxStream<'static, Result<ModelEvent, ChatError>>;

/// Chat-completion collaborator.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Start a reply to `messages`, offering `tools`.
    async fn stream(&self, messages: &[ChatMessage], tools: &[ToolDescriptor]) -> Result<ModelStream, ChatError>;
}

/// Progress reported while the loop runs.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// Assistant text as it arrives.
    Text(String),
    /// A tool call is about to run.
    ToolStarted(RequestedToolCall),
    /// A tool call finished.
    ToolFinished {
        call_id: String,
        envelope: ToolCallEnvelope,
    },
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without calling tools.
    Completed,
    /// `max_rounds` was reached.
    MaxRounds,
}

/// Result of a loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub rounds: usize,
    pub tool_calls: usize,
    pub stop: StopReason,
}

/// Runs model rounds and the tools they request.
pub struct ToolLoop {
    router: Router,
    max_rounds: usize,
}

impl ToolLoop {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Run until the model stops calling tools. Assistant and tool messages
    /// are appended to `messages`.
    pub async fn run<F>(
        &self,
        model: &dyn ChatModel,
        messages: &mut Vec<ChatMessage>,
        mut sink: F,
    ) -> Result<LoopOutcome, ChatError>
    where
        F: FnMut(LoopEvent) + Send,
    {
        let mut tool_calls = 0;

        for round in 1..=self.max_rounds {
            let tools = self.router.list_available_tools();
            debug!(round, tools = tools.len(), "Starting model round");

            let mut stream = model.stream(messages, &tools).await?;
            let mut text = String::new();
            let mut calls = Vec::new();

            while let Some(event) = stream.next().await {
                match event? {
                    ModelEvent::Text(delta) => {
                        text.push_str(&delta);
                        sink(LoopEvent::Text(delta));
                    }
                    ModelEvent::ToolCall(call) => calls.push(call),
                    ModelEvent::Done => break,
                }
            }

            messages.push(ChatMessage::assistant(text, calls.clone()));
            if calls.is_empty() {
                info!(rounds = round, tool_calls, "Chat turn completed");
                return Ok(LoopOutcome {
                    rounds: round,
                    tool_calls,
                    stop: StopReason::Completed,
                });
            }

            for call in calls {
                tool_calls += 1;
                sink(LoopEvent::ToolStarted(call.clone()));
                let envelope = self.run_tool(&call).await;
                messages.push(ChatMessage::tool(call.id.clone(), envelope.model_text()));
                sink(LoopEvent::ToolFinished {
                    call_id: call.id,
                    envelope,
                });
            }
        }

        warn!(max_rounds = self.max_rounds, "Model kept requesting tools; stopping");
        Ok(LoopOutcome {
            rounds: self.max_rounds,
            tool_calls,
            stop: StopReason::MaxRounds,
        })
    }

    async fn run_tool(&self, call: &RequestedToolCall) -> ToolCallEnvelope {
        match ToolArguments::from_json(call.arguments.clone()) {
            Ok(arguments) => self.router.invoke(&call.name, arguments).await,
            Err(problem) => ToolCallEnvelope::failure(&call.name, ErrorKind::InvalidArguments, problem),
        }
    }
}
