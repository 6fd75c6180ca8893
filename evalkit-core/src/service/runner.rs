//! Invocation runner
//!
//! Drives one live case turn by turn against the agent runtime and rebuilds
//! each turn from the runtime's event stream.

use futures::StreamExt;
use tracing::debug;

use crate::context::EvalContext;
use crate::error::{EvalError, Result};
use crate::evalset::{Invocation, Message, SessionInput, ToolUse};
use crate::runtime::{AgentEvent, AgentRuntime, EventStream, RunOption, RunOptions};

/// Run overrides for one case: global options first, then the case's own
/// context messages appended, and its initial state (if any) as runtime state
pub(crate) fn case_run_options(
    global: &[RunOption],
    context_messages: &[Message],
    session_input: &SessionInput,
) -> RunOptions {
    let mut options = RunOptions::from_options(global);
    if !context_messages.is_empty() {
        options.apply(&RunOption::InjectContextMessages(context_messages.to_vec()));
    }
    if !session_input.state.is_empty() {
        options.apply(&RunOption::RuntimeState(session_input.state.clone()));
    }
    options
}

/// Replay `conversation` through the runtime and return the produced turns
pub(crate) async fn run_conversation(
    ctx: &EvalContext,
    runtime: &dyn AgentRuntime,
    conversation: &[Invocation],
    session_input: &SessionInput,
    session_id: &str,
    options: &RunOptions,
    context_messages: &[Message],
) -> Result<Vec<Invocation>> {
    let mut produced = Vec::with_capacity(conversation.len());
    for (idx, expected) in conversation.iter().enumerate() {
        let mut invocation = run_turn(
            ctx,
            runtime,
            &session_input.user_id,
            session_id,
            expected,
            options.clone(),
        )
        .await
        .map_err(|e| e.context(format!("run invocation {}", idx)))?;
        invocation.context_messages = context_messages.to_vec();
        produced.push(invocation);
    }
    Ok(produced)
}

async fn run_turn(
    ctx: &EvalContext,
    runtime: &dyn AgentRuntime,
    user_id: &str,
    session_id: &str,
    expected: &Invocation,
    options: RunOptions,
) -> Result<Invocation> {
    let user_content = expected.user_content.clone().ok_or_else(|| {
        EvalError::CaseValidation("invocation user content is nil".to_string())
    })?;
    if let Some(err) = ctx.err() {
        return Err(err);
    }

    let stream = tokio::select! {
        reason = ctx.done() => return Err(reason),
        started = runtime.run(ctx, user_id, session_id, user_content.clone(), options) => {
            started.map_err(|e| e.context("runner run"))?
        }
    };
    let (tool_uses, final_response) = consume(ctx, stream).await?;

    debug!(session_id, tool_calls = tool_uses.len(), "invocation finished");
    Ok(Invocation {
        invocation_id: uuid::Uuid::new_v4().to_string(),
        user_content: Some(user_content),
        final_response: Some(final_response),
        tool_uses,
        context_messages: Vec::new(),
    })
}

/// Collect the tool trace and the final response from one event stream
async fn consume(ctx: &EvalContext, mut stream: EventStream) -> Result<(Vec<ToolUse>, Message)> {
    let mut tool_uses: Vec<ToolUse> = Vec::new();
    loop {
        let event = tokio::select! {
            reason = ctx.done() => return Err(reason),
            event = stream.next() => event,
        };
        match event {
            Some(AgentEvent::ToolCall { id, name, args }) => {
                tool_uses.push(ToolUse::new(id, name, args));
            }
            Some(AgentEvent::ToolResult { id, result, .. }) => {
                let call = tool_uses.iter_mut().find(|t| t.id == id).ok_or_else(|| {
                    EvalError::Runtime(format!("tool result references unknown tool call id {}", id))
                })?;
                call.result = Some(result);
            }
            Some(AgentEvent::Partial { .. }) => {}
            Some(AgentEvent::Error { message }) => {
                return Err(EvalError::Runtime(format!("runner event error: {}", message)));
            }
            Some(AgentEvent::FinalResponse { message }) => return Ok((tool_uses, message)),
            None => {
                return Err(EvalError::Runtime(
                    "runner stream closed without a final response".to_string(),
                ));
            }
        }
    }
}
