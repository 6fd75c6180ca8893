//! Agent runtime contract
//!
//! The engine never talks to a model directly. It hands each user turn to an
//! [`AgentRuntime`] and consumes the returned event stream: zero or more
//! intermediate events followed by exactly one [`AgentEvent::FinalResponse`]
//! on success.

mod replay;

pub use replay::ReplayRuntime;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;

use crate::context::EvalContext;
use crate::error::Result;
use crate::evalset::Message;

/// Event emitted by an agent runtime while answering one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The agent started a tool call
    ToolCall { id: String, name: String, args: Value },
    /// A tool call finished
    ToolResult { id: String, name: String, result: Value },
    /// Streamed partial text
    Partial { content: String },
    /// Terminal answer for the turn
    FinalResponse { message: Message },
    /// The runtime failed mid-stream
    Error { message: String },
}

/// Single-consumer stream of runtime events
pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// One run-time override applied to every runner call
#[derive(Debug, Clone, PartialEq)]
pub enum RunOption {
    /// Append messages to the injected context
    InjectContextMessages(Vec<Message>),
    /// Replace the runtime state
    RuntimeState(Map<String, Value>),
    /// Set one metadata entry
    Metadata(String, Value),
}

/// Effective overrides handed to the runtime for one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub injected_context_messages: Vec<Message>,
    pub runtime_state: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl RunOptions {
    /// Fold options in order
    pub fn from_options<'a>(options: impl IntoIterator<Item = &'a RunOption>) -> Self {
        let mut resolved = Self::default();
        for option in options {
            resolved.apply(option);
        }
        resolved
    }

    /// Apply one option on top of the current values
    pub fn apply(&mut self, option: &RunOption) {
        match option {
            RunOption::InjectContextMessages(messages) => {
                self.injected_context_messages.extend(messages.iter().cloned())
            }
            RunOption::RuntimeState(state) => self.runtime_state = state.clone(),
            RunOption::Metadata(key, value) => {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Runtime that answers conversation turns
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start answering `message` for the given user and session
    async fn run(
        &self,
        ctx: &EvalContext,
        user_id: &str,
        session_id: &str,
        message: Message,
        options: RunOptions,
    ) -> Result<EventStream>;
}
