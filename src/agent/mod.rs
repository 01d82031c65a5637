//! The agent-under-test capability and the reference onboarding agent.

mod onboarding;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    state::OnboardingState,
    transcript::{ToolInvocation, Turn},
    LLMError,
};

pub use onboarding::OnboardingAgent;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("template error: {0}")]
    Template(#[from] handlebars::TemplateError),
    #[error("template render error: {0}")]
    TemplateRender(#[from] handlebars::RenderError),
}

/// What the agent produced for one user message.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub response: String,
    pub state: OnboardingState,
    pub tool_calls: Vec<ToolInvocation>,
}

#[async_trait]
pub trait AgentUnderTest: Send + Sync {
    /// Handles `user_message`, which arrives at `state.stage` after
    /// `history`, and returns the updated state.
    async fn respond(
        &self,
        history: &[Turn],
        state: &OnboardingState,
        user_message: &str,
    ) -> Result<AgentReply, AgentError>;

    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<(), AgentError> {
        Ok(())
    }
}
