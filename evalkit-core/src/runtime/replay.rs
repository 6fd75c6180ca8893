//! Offline runtime that replays recorded answers
//!
//! Each user message is answered with the tool calls, tool results and final
//! response of the recorded invocation carrying the same user text. This gives
//! deterministic inference runs without a model, in the spirit of stubbed tools.

use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{AgentEvent, AgentRuntime, EventStream, RunOptions};
use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::{EvalSet, Invocation, Message};

/// Runtime answering from recorded invocations
pub struct ReplayRuntime {
    answers: HashMap<String, Invocation>,
    delay: Duration,
    call_count: AtomicUsize,
}

impl ReplayRuntime {
    /// Create a runtime from recorded invocations keyed by their user text
    pub fn new(invocations: impl IntoIterator<Item = Invocation>) -> Self {
        let mut answers = HashMap::new();
        for invocation in invocations {
            if let Some(user) = invocation.user_content.as_ref() {
                answers.entry(user.content.clone()).or_insert(invocation);
            }
        }
        Self {
            answers,
            delay: Duration::ZERO,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Create a runtime from every expected conversation in an eval set
    pub fn from_set(set: &EvalSet) -> Self {
        Self::new(
            set.eval_cases
                .iter()
                .flat_map(|c| c.conversation.iter().cloned()),
        )
    }

    /// Delay every answer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of runs served so far
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn events_for(invocation: &Invocation) -> Vec<AgentEvent> {
        let mut events = Vec::with_capacity(invocation.tool_uses.len() * 2 + 1);
        for tool_use in &invocation.tool_uses {
            events.push(AgentEvent::ToolCall {
                id: tool_use.id.clone(),
                name: tool_use.name.clone(),
                args: tool_use.args.clone(),
            });
        }
        for tool_use in &invocation.tool_uses {
            if let Some(result) = tool_use.result.as_ref() {
                events.push(AgentEvent::ToolResult {
                    id: tool_use.id.clone(),
                    name: tool_use.name.clone(),
                    result: result.clone(),
                });
            }
        }
        if let Some(message) = invocation.final_response.as_ref() {
            events.push(AgentEvent::FinalResponse {
                message: message.clone(),
            });
        }
        events
    }
}

#[async_trait]
impl AgentRuntime for ReplayRuntime {
    async fn run(
        &self,
        ctx: &EvalContext,
        _user_id: &str,
        _session_id: &str,
        message: Message,
        _options: RunOptions,
    ) -> Result<EventStream> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::select! {
                reason = ctx.done() => return Err(reason),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let invocation = self.answers.get(&message.content).ok_or_else(|| {
            EvalError::Runtime(format!("no recorded answer for message {:?}", message.content))
        })?;
        Ok(Box::pin(stream::iter(Self::events_for(invocation))))
    }
}
