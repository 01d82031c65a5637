use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::Stage;

/// A tool call the agent made while handling a turn, with what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            output: None,
            error: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// One user message and the agent's handling of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user_message: String,
    /// Advisory: the stage the scenario author expected this message to
    /// arrive at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_notes: Option<String>,
    #[serde(default, alias = "assistant_message")]
    pub agent_response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    /// Stage after the agent handled the turn. Hand-written history may
    /// leave it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl Turn {
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tool_calls.iter().map(|call| call.name.as_str())
    }
}
