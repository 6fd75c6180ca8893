//! Eval sets, eval cases and the conversation model
//!
//! An eval set is a named collection of eval cases. Each case is a recorded
//! conversation script plus the session input needed to replay it against an
//! agent. Field names serialize in camelCase so recorded sets stay readable by
//! other tooling.

mod inmemory;

pub use inmemory::InMemoryCaseSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::context::EvalContext;
use crate::error::{EvalError, Result};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// One tool call made during a turn, with its result once known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    /// Call id assigned by the agent
    pub id: String,

    /// Tool name
    pub name: String,

    /// Arguments passed
    #[serde(default)]
    pub args: Value,

    /// Tool result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ToolUse {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            result: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// One conversation turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// Invocation identifier
    #[serde(default)]
    pub invocation_id: String,

    /// What the user said
    #[serde(default)]
    pub user_content: Option<Message>,

    /// What the agent finally answered
    #[serde(default)]
    pub final_response: Option<Message>,

    /// Tool calls in the order they were started
    #[serde(default)]
    pub tool_uses: Vec<ToolUse>,

    /// Context messages injected for this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_messages: Vec<Message>,
}

impl Invocation {
    /// Create a turn from a user message
    pub fn from_user(content: impl Into<String>) -> Self {
        Self {
            user_content: Some(Message::user(content)),
            ..Default::default()
        }
    }

    /// Set the expected or recorded final response
    pub fn with_final_response(mut self, content: impl Into<String>) -> Self {
        self.final_response = Some(Message::assistant(content));
        self
    }

    /// Add a tool call
    pub fn with_tool_use(mut self, tool_use: ToolUse) -> Self {
        self.tool_uses.push(tool_use);
        self
    }

    /// Text of the final response, if any
    pub fn final_text(&self) -> Option<&str> {
        self.final_response.as_ref().map(|m| m.content.as_str())
    }
}

/// Session seed for a case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    /// App the session belongs to
    #[serde(default)]
    pub app_name: String,

    /// User the session belongs to
    pub user_id: String,

    /// Initial session state
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl SessionInput {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            app_name: String::new(),
            user_id: user_id.into(),
            state: Map::new(),
        }
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }
}

/// How a case is run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
    /// Drive the agent runtime turn by turn
    #[default]
    #[serde(alias = "live", alias = "")]
    Default,
    /// Use the recorded conversation as truth
    Trace,
}

/// One recorded test scenario
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalCase {
    /// Case identifier, unique within its set
    pub eval_id: String,

    /// Expected conversation
    #[serde(default)]
    pub conversation: Vec<Invocation>,

    /// Pre-recorded actual conversation (trace mode only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actual_conversation: Vec<Invocation>,

    /// Session seed
    #[serde(default)]
    pub session_input: Option<SessionInput>,

    /// Evaluation mode
    #[serde(default)]
    pub eval_mode: EvalMode,

    /// Seed messages injected before every turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_messages: Vec<Message>,
}

impl EvalCase {
    /// Create a live case with a session for `user_id`
    pub fn new(eval_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            eval_id: eval_id.into(),
            session_input: Some(SessionInput::new(user_id)),
            ..Default::default()
        }
    }

    pub fn with_invocation(mut self, invocation: Invocation) -> Self {
        self.conversation.push(invocation);
        self
    }

    pub fn with_mode(mut self, mode: EvalMode) -> Self {
        self.eval_mode = mode;
        self
    }

    pub fn with_context_message(mut self, message: Message) -> Self {
        self.context_messages.push(message);
        self
    }

    /// User id from the session input, empty when there is none
    pub fn user_id(&self) -> &str {
        self.session_input
            .as_ref()
            .map(|s| s.user_id.as_str())
            .unwrap_or_default()
    }
}

/// A named collection of eval cases
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalSet {
    pub eval_set_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub eval_cases: Vec<EvalCase>,
}

impl EvalSet {
    pub fn new(eval_set_id: impl Into<String>) -> Self {
        let eval_set_id = eval_set_id.into();
        Self {
            name: eval_set_id.clone(),
            eval_set_id,
            description: None,
            eval_cases: Vec::new(),
        }
    }

    pub fn with_case(mut self, eval_case: EvalCase) -> Self {
        self.eval_cases.push(eval_case);
        self
    }

    /// Find a case by id
    pub fn case(&self, eval_id: &str) -> Option<&EvalCase> {
        self.eval_cases.iter().find(|c| c.eval_id == eval_id)
    }

    /// Load an eval set from a JSON or YAML file (by extension)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let set = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(set)
    }

    /// Save the eval set to a JSON or YAML file (by extension)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Source of eval sets
#[async_trait]
pub trait CaseSource: Send + Sync {
    /// Fetch one eval set
    async fn get(&self, ctx: &EvalContext, app_name: &str, eval_set_id: &str) -> Result<EvalSet>;

    /// List eval set ids for an app
    async fn list(&self, ctx: &EvalContext, app_name: &str) -> Result<Vec<String>>;
}

pub(crate) fn not_found(app_name: &str, eval_set_id: &str) -> EvalError {
    EvalError::NotFound(format!("eval set {}.{}", app_name, eval_set_id))
}
