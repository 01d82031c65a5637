//! Parametric step scenarios: synthetic history up to a stage plus the
//! expectations for the next turn, written out as task directories.

use std::{collections::BTreeMap, fs, path::Path};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    error::EvalError,
    eval::scenario::{EvalMode, EXPECTED_FILE, INSTRUCTION_FILE},
    state::{OnboardingState, Plan, Stage},
    tools::{is_valid_email, CHECK_VERIFICATION_CODE, CREATE_ACCOUNT, VALIDATE_EMAIL},
};

pub const NAMES: [&str; 8] = [
    "Walker Thompson",
    "María García-López",
    "张伟",
    "Dr. Sarah Patel",
    "O'Brien",
    "Jean-Pierre Dubois",
    "",
    "A",
];

pub const EMAILS: [&str; 6] = [
    "walker@example.com",
    "bad-email",
    "maria.garcia+signup@example.co.uk",
    "zhang.wei@example.cn",
    "",
    "multiple@one .com second@example.com",
];

pub const PLANS: [Option<&str>; 5] = [
    Some("free"),
    Some("pro"),
    Some("enterprise"),
    Some("invalid_plan"),
    None,
];

const GREETING: &str =
    "Welcome! I'm here to help you set up your new account. To get started, could you please tell me your name?";

/// A chat line as scenario files store it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryMessage {
    pub role: &'static str,
    pub content: String,
}

impl HistoryMessage {
    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Inputs for one generated step.
#[derive(Debug, Clone, Copy)]
pub struct StepTask<'a> {
    pub stage: Stage,
    pub name: &'a str,
    pub email: &'a str,
    pub plan: Option<&'a str>,
}

#[derive(Serialize)]
struct GeneratedScenario<'a> {
    eval_mode: EvalMode,
    current_stage: Stage,
    history: &'a [HistoryMessage],
    accumulated_state: &'a OnboardingState,
}

fn generatable(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::CollectName
            | Stage::CollectEmail
            | Stage::VerifyEmail
            | Stage::SelectPlan
            | Stage::CollectPreferences
            | Stage::Confirm
    )
}

/// Conversation up to `stage`, alternating assistant and user and ending
/// with the user message the agent must answer next.
pub fn build_history_for_stage(
    stage: Stage,
    name: &str,
    email: &str,
    plan: Option<&str>,
) -> Vec<HistoryMessage> {
    let mut history = vec![HistoryMessage::assistant(GREETING)];

    if stage == Stage::CollectName {
        history.push(HistoryMessage::user(if name.is_empty() {
            "Hello!".to_string()
        } else {
            format!("Hi! I'm {name}")
        }));
        return history;
    }

    let display_name = if name.is_empty() { "User" } else { name };
    history.push(HistoryMessage::user(if name.is_empty() {
        "I'd rather not say".to_string()
    } else {
        format!("Hi there, my name is {name}")
    }));
    history.push(HistoryMessage::assistant(format!(
        "NAME: {display_name}\nGreat to meet you! Now I'll need your email address."
    )));

    if stage == Stage::CollectEmail {
        history.push(HistoryMessage::user(if email.is_empty() {
            "Here's my email".to_string()
        } else {
            format!("Sure, it's {email}")
        }));
        return history;
    }

    history.push(HistoryMessage::user(if email.is_empty() {
        "I don't have one".to_string()
    } else {
        format!("My email is {email}")
    }));
    history.push(HistoryMessage::assistant(format!(
        "Thanks! I've sent a verification code to {email}. Could you enter the code?"
    )));

    history.push(HistoryMessage::user("The code is 123456"));
    if stage == Stage::VerifyEmail {
        return history;
    }
    history.push(HistoryMessage::assistant(
        "Email verified! Now let's choose a plan. We have free, pro, and enterprise options.",
    ));

    if stage == Stage::SelectPlan {
        history.push(HistoryMessage::user(match plan {
            Some(plan) => format!("I'll go with the {plan} plan"),
            None => "What plans do you have?".to_string(),
        }));
        return history;
    }

    let plan = plan.unwrap_or("free");
    history.push(HistoryMessage::user(format!("I'd like the {plan} plan")));
    history.push(HistoryMessage::assistant(format!(
        "PLAN: {plan}\nExcellent choice! Now let me ask about your preferences."
    )));

    if stage == Stage::CollectPreferences {
        history.push(HistoryMessage::user("I prefer dark mode and email notifications"));
        return history;
    }

    history.push(HistoryMessage::user("Dark mode and weekly email digests please"));
    history.push(HistoryMessage::assistant(
        "PREFERENCES: {\"theme\": \"dark\", \"notifications\": \"weekly\"}\nLet me summarize everything for your confirmation.",
    ));
    history.push(HistoryMessage::user("Yes, that all looks correct!"));
    history
}

fn known_plan(plan: Option<&str>) -> Option<Plan> {
    plan.and_then(|plan| plan.parse().ok())
}

pub fn expected_next_stage(task: &StepTask<'_>) -> Stage {
    match task.stage {
        Stage::CollectName if task.name.is_empty() => Stage::CollectName,
        Stage::CollectEmail if !is_valid_email(task.email) => Stage::CollectEmail,
        Stage::SelectPlan if known_plan(task.plan).is_none() => Stage::SelectPlan,
        stage => stage.next().unwrap_or(stage),
    }
}

pub fn expected_state(task: &StepTask<'_>) -> BTreeMap<String, Value> {
    let mut state = BTreeMap::new();
    match task.stage {
        Stage::CollectName if !task.name.is_empty() => {
            state.insert("user_name".to_string(), json!(task.name));
        }
        Stage::CollectEmail if is_valid_email(task.email) => {
            state.insert("email".to_string(), json!(task.email));
        }
        Stage::VerifyEmail => {
            state.insert("email_verified".to_string(), json!(true));
        }
        Stage::SelectPlan => {
            if let Some(plan) = known_plan(task.plan) {
                state.insert("plan".to_string(), json!(plan.as_str()));
            }
        }
        _ => {}
    }
    state
}

pub fn required_tools(task: &StepTask<'_>) -> Vec<String> {
    let tools: &[&str] = match task.stage {
        Stage::CollectEmail if !task.email.is_empty() => &[VALIDATE_EMAIL],
        Stage::VerifyEmail => &[CHECK_VERIFICATION_CODE],
        Stage::Confirm => &[CREATE_ACCOUNT],
        _ => &[],
    };
    tools.iter().map(|tool| tool.to_string()).collect()
}

/// State the agent holds when the driven message arrives.
pub fn accumulated_state(task: &StepTask<'_>) -> OnboardingState {
    let reached = |stage: Stage| task.stage > stage;
    let mut state = OnboardingState {
        stage: task.stage,
        ..OnboardingState::default()
    };
    if reached(Stage::CollectName) {
        state.name = Some(task.name.to_string());
    }
    if reached(Stage::CollectEmail) {
        state.email = Some(task.email.to_string());
    }
    if reached(Stage::VerifyEmail) {
        state.email_verified = true;
    }
    if reached(Stage::SelectPlan) {
        state.plan = Some(known_plan(task.plan).unwrap_or(Plan::Free));
    }
    if reached(Stage::CollectPreferences) {
        state.preferences = [
            ("theme".to_string(), json!("dark")),
            ("notifications".to_string(), json!("weekly")),
        ]
        .into_iter()
        .collect();
    }
    state
}

/// Writes `instruction.md` (the scenario as a fenced JSON block) and
/// `expected.json` into `dir`.
pub fn write_step_task(dir: &Path, task: &StepTask<'_>) -> Result<(), EvalError> {
    if !generatable(task.stage) {
        return Err(EvalError::Config(format!(
            "cannot generate a step task at stage {}",
            task.stage
        )));
    }
    fs::create_dir_all(dir)?;

    let history = build_history_for_stage(task.stage, task.name, task.email, task.plan);
    let state = accumulated_state(task);
    let scenario = GeneratedScenario {
        eval_mode: EvalMode::Step,
        current_stage: task.stage,
        history: &history,
        accumulated_state: &state,
    };
    let instruction = format!("```json\n{}\n```\n", serde_json::to_string_pretty(&scenario)?);
    fs::write(dir.join(INSTRUCTION_FILE), instruction)?;

    let expected = json!({
        "expected_stage": expected_next_stage(task),
        "expected_state": expected_state(task),
        "required_tools": required_tools(task),
        "disallowed_tools": [],
        "disallowed_patterns": [],
    });
    fs::write(
        dir.join(EXPECTED_FILE),
        format!("{}\n", serde_json::to_string_pretty(&expected)?),
    )?;

    debug!(dir = %dir.display(), stage = %task.stage, "step task written");
    Ok(())
}

/// The default matrix: the first four names by the first three emails, all
/// at `collect_email` on the free plan, as `gen-000`, `gen-001`, ...
pub fn generate_default_matrix(output: &Path) -> Result<usize, EvalError> {
    let mut count = 0;
    for name in &NAMES[..4] {
        for email in &EMAILS[..3] {
            let task = StepTask {
                stage: Stage::CollectEmail,
                name: *name,
                email: *email,
                plan: Some("free"),
            };
            write_step_task(&output.join(format!("gen-{count:03}")), &task)?;
            count += 1;
        }
    }
    info!(count, output = %output.display(), "generated step tasks");
    Ok(count)
}
