pub mod agent;
pub mod config;
pub mod error;
pub mod eval;
pub mod functions;
pub mod providers;
pub mod state;
pub mod tools;
pub mod transcript;
pub mod types;

pub use agent::{AgentError, AgentReply, AgentUnderTest, OnboardingAgent};
pub use config::EvalConfig;
pub use error::{EvalError, LLMError};
pub use eval::{
    judge::{FixedJudge, Judge, JudgeClient, JudgeCriterion, LlmJudge},
    report::{RunAccumulator, RunReport, RunSummary, ScenarioRecord},
    runner::EvalRunner,
    scenario::{load_scenarios, EvalMode, Expectation, LoadedScenario, Scenario},
    verdict::{Failure, FailureKind, Verdict, VerdictStatus},
};
pub use functions::{FunctionCall, FunctionDefinition, FunctionRegistry, KernelFunction, ToolCall};
pub use providers::LLMProvider;
pub use state::{OnboardingState, Plan, Stage};
pub use tools::{onboarding_registry, ToolMode};
pub use transcript::{ToolInvocation, Turn};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use schemars::JsonSchema;
