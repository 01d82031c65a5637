use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{AgentError, AgentReply, AgentUnderTest};
use crate::{
    functions::{FunctionRegistry, ToolCall, ToolChoice},
    state::{OnboardingState, Plan, Stage},
    tools::{
        CHECK_VERIFICATION_CODE, CREATE_ACCOUNT, GET_PLAN_DETAILS, SEND_VERIFICATION_CODE,
        VALIDATE_EMAIL,
    },
    transcript::{ToolInvocation, Turn},
    types::{ChatMessage, CompletionRequest},
    LLMProvider,
};

const SUMMARY_TEMPLATE: &str = "confirm_summary";

const CONFIRM_SUMMARY: &str = "Summarize the user's information and ask them to confirm:\n\n\
Name: {{name}}\n\
Email: {{email}}\n\
Plan: {{plan}}\n\
Preferences: {{preferences}}\n\n\
Ask if everything looks correct.";

static NAME_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^NAME:\s*(.+)").expect("name directive pattern"));
static PLAN_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^PLAN:\s*(.+)").expect("plan directive pattern"));
static PREFERENCES_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^PREFERENCES:\s*(.+)").expect("preferences directive pattern"));
static WANTS_CHANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(change|go back)\b").expect("change pattern"));
static CONFIRMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(yes|confirm\w*)\b").expect("confirm pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfirmIntent {
    Change,
    Confirm,
    Unclear,
}

impl ConfirmIntent {
    fn of(message: &str) -> Self {
        if WANTS_CHANGE.is_match(message) {
            ConfirmIntent::Change
        } else if CONFIRMS.is_match(message) {
            ConfirmIntent::Confirm
        } else {
            ConfirmIntent::Unclear
        }
    }
}

fn stage_prompt(stage: Stage) -> &'static str {
    match stage {
        Stage::Greeting => {
            "You are a friendly onboarding assistant. Greet the user warmly and ask for their name."
        }
        Stage::CollectName => {
            "Extract the user's name from their message. If you can identify their name, respond \
             with the first line as 'NAME: <their name>' followed by a friendly acknowledgment and \
             a request for their email address. If you cannot determine their name, ask them again \
             politely."
        }
        Stage::CollectEmail => {
            "You are collecting the user's email address. Use the validate_email tool to check \
             if the email is valid. If valid, confirm it and tell them a verification code is on \
             its way. If invalid, ask them to try again."
        }
        Stage::VerifyEmail => {
            "You are verifying the user's email address. Use send_verification_code to send a \
             code, then use check_verification_code to verify the code the user provides."
        }
        Stage::SelectPlan => {
            "Help the user choose a plan (free, pro, or enterprise). Use the get_plan_details tool \
             to show plan information. When the user has chosen a plan, respond with the first \
             line as 'PLAN: <plan_name>'. If they're still browsing, continue helping without the \
             PLAN prefix."
        }
        Stage::CollectPreferences => {
            "Collect the user's preferences (e.g., notifications, theme, language). When you have \
             gathered all preferences, respond with the first line as \
             'PREFERENCES: {\"key\": \"value\", ...}' as valid JSON. If the user hasn't provided \
             enough preferences yet, continue asking."
        }
        Stage::Confirm => {
            "The user has confirmed their details. Use create_account to finalize their account."
        }
        Stage::Complete => {
            "The user's account has been created. Answer any remaining questions briefly."
        }
        Stage::Error => {
            "Onboarding could not be completed because of too many invalid email attempts. \
             Apologize and suggest the user try again later."
        }
    }
}

const CHANGE_PROMPT: &str = "The user wants to change their details. Acknowledge it and help them \
    choose a plan again (free, pro, or enterprise). Use get_plan_details if they ask about a plan.";

const CHANGE_TOOLS: &[&str] = &[GET_PLAN_DETAILS];
const NO_TOOLS: &[&str] = &[];

fn stage_tools(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::CollectEmail => &[VALIDATE_EMAIL, SEND_VERIFICATION_CODE],
        Stage::VerifyEmail => &[SEND_VERIFICATION_CODE, CHECK_VERIFICATION_CODE],
        Stage::SelectPlan => &[GET_PLAN_DETAILS],
        Stage::Confirm => &[CREATE_ACCOUNT],
        _ => &[],
    }
}

/// Splits a `KEY: value` directive off the first line of a response.
fn directive<'a>(pattern: &Regex, content: &'a str) -> Option<(String, &'a str)> {
    let trimmed = content.trim();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    let captures = pattern.captures(first.trim())?;
    let value = captures.get(1)?.as_str().trim().to_string();
    Some((value, rest.trim()))
}

fn parse_plan(content: &str) -> Option<Plan> {
    let (value, _) = directive(&PLAN_DIRECTIVE, content)?;
    value.parse().ok()
}

fn parse_preferences(content: &str) -> Option<BTreeMap<String, Value>> {
    let (value, _) = directive(&PREFERENCES_DIRECTIVE, content)?;
    match serde_json::from_str::<Value>(&value).ok()? {
        Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

/// The text shown to the user: the response without its directive line.
fn visible_reply(content: &str) -> String {
    for pattern in [&*NAME_DIRECTIVE, &*PLAN_DIRECTIVE, &*PREFERENCES_DIRECTIVE] {
        if let Some((_, rest)) = directive(pattern, content) {
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    content.trim().to_string()
}

fn first_output<'a>(calls: &'a [ToolInvocation], tool: &str) -> Option<&'a ToolInvocation> {
    calls
        .iter()
        .find(|call| call.name == tool && call.output.is_some())
}

/// LLM-backed agent that walks the onboarding flow one completion per turn.
#[derive(Clone)]
pub struct OnboardingAgent {
    provider: Arc<dyn LLMProvider>,
    model: String,
    functions: Arc<FunctionRegistry>,
    templates: Handlebars<'static>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_email_retries: u32,
}

impl fmt::Debug for OnboardingAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnboardingAgent")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_email_retries", &self.max_email_retries)
            .finish()
    }
}

impl OnboardingAgent {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
        functions: Arc<FunctionRegistry>,
    ) -> Result<Self, AgentError> {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        templates.register_template_string(SUMMARY_TEMPLATE, CONFIRM_SUMMARY)?;

        Ok(Self {
            provider,
            model: model.into(),
            functions,
            templates,
            temperature: None,
            max_tokens: None,
            max_email_retries: 3,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Swaps the tool registry, e.g. for a fresh set of real-mode codes.
    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    /// Invalid email attempts tolerated before the flow aborts.
    pub fn with_max_email_retries(mut self, retries: u32) -> Self {
        self.max_email_retries = retries;
        self
    }

    fn summary_prompt(&self, state: &OnboardingState) -> Result<String, AgentError> {
        let preferences = serde_json::to_string(&state.preferences).map_err(crate::LLMError::from)?;
        let data = json!({
            "name": state.name.as_deref().unwrap_or("N/A"),
            "email": state.email.as_deref().unwrap_or("N/A"),
            "plan": state.plan.map(Plan::as_str).unwrap_or("N/A"),
            "preferences": preferences,
        });
        Ok(self.templates.render(SUMMARY_TEMPLATE, &data)?)
    }

    fn messages(&self, system: String, history: &[Turn], user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(ChatMessage::system(system));
        for turn in history {
            messages.push(ChatMessage::user(turn.user_message.clone()));
            if !turn.agent_response.trim().is_empty() {
                messages.push(ChatMessage::assistant(turn.agent_response.clone()));
            }
        }
        messages.push(ChatMessage::user(user_message));
        messages
    }

    async fn run_tools(
        &self,
        stage: Stage,
        offered: &[&str],
        calls: &[ToolCall],
    ) -> Vec<ToolInvocation> {
        let mut invocations = Vec::with_capacity(calls.len());
        for call in calls {
            let name = call.function.name.clone();
            let invocation = ToolInvocation::new(name.clone(), call.function.arguments.clone());
            if !offered.contains(&name.as_str()) {
                warn!(tool = %name, stage = %stage, "agent called a tool that was not offered");
                invocations.push(
                    invocation.with_error(format!("tool {name} is not available at stage {stage}")),
                );
                continue;
            }
            let invocation = match self.functions.invoke(&call.function).await {
                Ok(output) => invocation.with_output(output),
                Err(error) => invocation.with_error(error.to_string()),
            };
            invocations.push(invocation);
        }
        invocations
    }

    fn advance(
        &self,
        stage: Stage,
        intent: Option<ConfirmIntent>,
        content: &str,
        calls: &[ToolInvocation],
        state: &mut OnboardingState,
    ) {
        match stage {
            Stage::Greeting => state.stage = Stage::CollectName,
            Stage::CollectName => {
                if let Some((name, _)) = directive(&NAME_DIRECTIVE, content) {
                    state.set_name(name);
                    state.stage = Stage::CollectEmail;
                }
            }
            Stage::CollectEmail => {
                let Some(call) = first_output(calls, VALIDATE_EMAIL) else {
                    return;
                };
                let email = call.arguments.get("email").and_then(Value::as_str);
                match (call.output.as_ref().and_then(Value::as_bool), email) {
                    (Some(true), Some(email)) => {
                        state.set_email(email.trim());
                        state.retry_count = 0;
                        state.stage = Stage::VerifyEmail;
                    }
                    _ => {
                        state.retry_count += 1;
                        if state.retry_count > self.max_email_retries {
                            state.stage = Stage::Error;
                            state.error_message = Some("Too many invalid email attempts.".to_string());
                        }
                    }
                }
            }
            Stage::VerifyEmail => {
                let verified = calls.iter().any(|call| {
                    call.name == CHECK_VERIFICATION_CODE
                        && call.output.as_ref().and_then(Value::as_bool) == Some(true)
                });
                if verified {
                    match state.mark_email_verified() {
                        Ok(()) => state.stage = Stage::SelectPlan,
                        Err(error) => warn!(%error, "verification code accepted but state refused it"),
                    }
                }
            }
            Stage::SelectPlan => {
                if let Some(plan) = parse_plan(content) {
                    match state.select_plan(plan) {
                        Ok(()) => state.stage = Stage::CollectPreferences,
                        Err(error) => warn!(%error, "plan chosen but state refused it"),
                    }
                }
            }
            Stage::CollectPreferences => {
                if let Some(preferences) = parse_preferences(content) {
                    state.set_preferences(preferences);
                    state.stage = Stage::Confirm;
                }
            }
            Stage::Confirm => match intent {
                Some(ConfirmIntent::Change) => state.stage = Stage::SelectPlan,
                Some(ConfirmIntent::Confirm) => {
                    if first_output(calls, CREATE_ACCOUNT).is_some() {
                        if let Err(error) = state.mark_account_created() {
                            warn!(%error, "account tool succeeded but state is incomplete");
                        }
                    }
                }
                _ => {}
            },
            Stage::Complete | Stage::Error => {}
        }
    }
}

#[async_trait]
impl AgentUnderTest for OnboardingAgent {
    async fn respond(
        &self,
        history: &[Turn],
        state: &OnboardingState,
        user_message: &str,
    ) -> Result<AgentReply, AgentError> {
        let stage = state.stage;
        let intent = (stage == Stage::Confirm).then(|| ConfirmIntent::of(user_message));

        let (system, offered) = match intent {
            Some(ConfirmIntent::Change) => (CHANGE_PROMPT.to_string(), CHANGE_TOOLS),
            Some(ConfirmIntent::Unclear) => (self.summary_prompt(state)?, NO_TOOLS),
            _ => (stage_prompt(stage).to_string(), stage_tools(stage)),
        };

        let mut request =
            CompletionRequest::new(self.model.clone(), self.messages(system, history, user_message));
        if !offered.is_empty() {
            request = request
                .with_tools(self.functions.tools_named(offered))
                .with_tool_choice(ToolChoice::auto());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.provider.complete(request).await?;
        let content = response.message.text().unwrap_or_default().to_string();
        let tool_calls = self
            .run_tools(stage, offered, &response.message.tool_calls)
            .await;

        let mut next = state.clone();
        self.advance(stage, intent, &content, &tool_calls, &mut next);
        debug!(from = %stage, to = %next.stage, tools = tool_calls.len(), "agent turn handled");

        Ok(AgentReply {
            response: visible_reply(&content),
            state: next,
            tool_calls,
        })
    }

    fn name(&self) -> &str {
        "onboarding-agent"
    }

    /// One-token completion against the configured model.
    async fn health_check(&self) -> Result<(), AgentError> {
        let ping = CompletionRequest::new(self.model.clone(), vec![ChatMessage::user("ping")])
            .with_max_tokens(1);
        self.provider
            .complete(ping)
            .await
            .map(|_| ())
            .map_err(|error| AgentError::Unavailable(format!("{}: {error}", self.provider.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::{ScriptedProvider, ScriptedResponse};
    use crate::tools::{onboarding_registry, ToolMode};

    fn agent(responses: Vec<ScriptedResponse>) -> (OnboardingAgent, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(responses));
        let agent = OnboardingAgent::new(
            provider.clone(),
            "test-model",
            Arc::new(onboarding_registry(ToolMode::Mock)),
        )
        .expect("agent");
        (agent, provider)
    }

    fn at(stage: Stage) -> OnboardingState {
        OnboardingState {
            stage,
            ..OnboardingState::default()
        }
    }

    #[test]
    fn directives_read_the_first_line_only() {
        assert_eq!(
            directive(&NAME_DIRECTIVE, "NAME: Priya Sharma\nLovely to meet you!"),
            Some(("Priya Sharma".to_string(), "Lovely to meet you!"))
        );
        assert_eq!(directive(&NAME_DIRECTIVE, "Hello!\nNAME: Priya"), None);
        assert_eq!(parse_plan("plan: Enterprise"), Some(Plan::Enterprise));
        assert_eq!(parse_plan("PLAN: platinum"), None);
        assert_eq!(
            parse_preferences("PREFERENCES: {\"theme\": \"dark\"}").map(|p| p.len()),
            Some(1)
        );
        assert_eq!(parse_preferences("PREFERENCES: dark mode"), None);
        assert_eq!(visible_reply("NAME: Priya\nThanks, Priya!"), "Thanks, Priya!");
    }

    #[test]
    fn confirm_intent_prefers_change() {
        assert_eq!(ConfirmIntent::of("Yes, looks good"), ConfirmIntent::Confirm);
        assert_eq!(ConfirmIntent::of("Actually, can I change my plan?"), ConfirmIntent::Change);
        assert_eq!(ConfirmIntent::of("Let me go back please"), ConfirmIntent::Change);
        assert_eq!(ConfirmIntent::of("Hmm, what was my email?"), ConfirmIntent::Unclear);
    }

    #[tokio::test]
    async fn collects_name_from_directive() {
        let (agent, _) = agent(vec![ScriptedResponse::text(
            "NAME: Priya Sharma\nNice to meet you, Priya! What's your email?",
        )]);
        let reply = agent
            .respond(&[], &at(Stage::CollectName), "I'm Priya Sharma")
            .await
            .expect("reply");
        assert_eq!(reply.state.name.as_deref(), Some("Priya Sharma"));
        assert_eq!(reply.state.stage, Stage::CollectEmail);
        assert!(!reply.response.contains("NAME:"));
    }

    #[tokio::test]
    async fn invalid_emails_eventually_abort() {
        let responses: Vec<_> = (0..4)
            .map(|_| {
                ScriptedResponse::text("That doesn't look right, try again?")
                    .with_tool_call(VALIDATE_EMAIL, json!({"email": "nope"}))
            })
            .collect();
        let provider = Arc::new(ScriptedProvider::new(responses));
        let agent = OnboardingAgent::new(
            provider,
            "m",
            Arc::new(onboarding_registry(ToolMode::Real)),
        )
        .expect("agent");

        let mut state = at(Stage::CollectEmail);
        for _ in 0..3 {
            state = agent.respond(&[], &state, "nope").await.expect("reply").state;
            assert_eq!(state.stage, Stage::CollectEmail);
        }
        state = agent.respond(&[], &state, "nope").await.expect("reply").state;
        assert_eq!(state.stage, Stage::Error);
        assert_eq!(state.retry_count, 4);
    }

    #[tokio::test]
    async fn tools_outside_the_stage_are_not_executed() {
        let (agent, provider) = agent(vec![ScriptedResponse::text("Creating your account!")
            .with_tool_call(CREATE_ACCOUNT, json!({"name": "P", "email": "p@x.io", "plan": "free"}))]);
        let reply = agent
            .respond(&[], &at(Stage::CollectName), "just make my account")
            .await
            .expect("reply");

        assert_eq!(reply.tool_calls.len(), 1);
        assert!(reply.tool_calls[0].output.is_none());
        assert!(reply.tool_calls[0].error.is_some());
        assert!(!reply.state.account_created);
        assert!(provider.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn unclear_confirmation_re_summarizes() {
        let (agent, provider) = agent(vec![ScriptedResponse::text("Here's what I have...")]);
        let mut state = at(Stage::Confirm);
        state.set_name("Priya Sharma");
        let reply = agent
            .respond(&[], &state, "Can you remind me what I picked?")
            .await
            .expect("reply");

        assert_eq!(reply.state.stage, Stage::Confirm);
        let system = provider.requests()[0].messages[0].text().unwrap_or_default().to_string();
        assert!(system.contains("Name: Priya Sharma"));
        assert!(system.contains("Plan: N/A"));
    }

    #[tokio::test]
    async fn change_request_branches_back_to_plan_selection() {
        let (agent, _) = agent(vec![ScriptedResponse::text("Sure, which plan would you like?")]);
        let reply = agent
            .respond(&[], &at(Stage::Confirm), "I want to change my plan")
            .await
            .expect("reply");
        assert_eq!(reply.state.stage, Stage::SelectPlan);
    }

    #[tokio::test]
    async fn provider_failure_is_an_agent_error() {
        let (agent, _) = agent(vec![ScriptedResponse::error("rate limited")]);
        let result = agent.respond(&[], &at(Stage::Greeting), "hi").await;
        assert!(matches!(result, Err(AgentError::Provider(_))));
    }
}
