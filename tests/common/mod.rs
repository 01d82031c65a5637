#![allow(dead_code)]

use std::sync::Arc;

use onboarding_eval::{
    onboarding_registry,
    providers::scripted::{ScriptedProvider, ScriptedResponse},
    AgentUnderTest, OnboardingAgent, Scenario, ToolMode,
};
use serde_json::{json, Value};

pub const EMAIL: &str = "priya@example.com";

pub fn agent_with(responses: Vec<ScriptedResponse>) -> (Arc<dyn AgentUnderTest>, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::new(responses));
    let agent = OnboardingAgent::new(
        provider.clone(),
        "scripted-model",
        Arc::new(onboarding_registry(ToolMode::Mock)),
    )
    .expect("agent");
    (Arc::new(agent), provider)
}

pub fn scenario(value: Value) -> Scenario {
    let fallback = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("scenario")
        .to_string();
    Scenario::from_json_str(&value.to_string(), &fallback).expect("valid scenario")
}

fn preferences() -> Value {
    json!({"notifications": "email", "theme": "dark"})
}

/// Agent side of the free-tier walk-through, one response per user turn.
pub fn free_tier_responses() -> Vec<ScriptedResponse> {
    vec![
        ScriptedResponse::text("Welcome! I'm here to help you set up your account. What's your name?"),
        ScriptedResponse::text("NAME: Priya Sharma\nLovely to meet you, Priya! What's your email address?"),
        ScriptedResponse::text(format!("Thanks! I've sent a 6-digit code to {EMAIL}."))
            .with_tool_call("validate_email", json!({"email": EMAIL}))
            .with_tool_call("send_verification_code", json!({"email": EMAIL})),
        ScriptedResponse::text("You're verified. Would you like the free, pro or enterprise plan?")
            .with_tool_call("check_verification_code", json!({"email": EMAIL, "code": "123456"})),
        ScriptedResponse::text("PLAN: free\nGreat choice! Any preferences for notifications or theme?"),
        ScriptedResponse::text(format!(
            "PREFERENCES: {}\nGot it. Let me pull together a summary.",
            preferences()
        )),
        ScriptedResponse::text(
            "Here's what I have: Priya Sharma, priya@example.com, the free plan, email \
             notifications and a dark theme. Does everything look correct?",
        ),
        ScriptedResponse::text("Your account is ready. Welcome aboard, Priya!").with_tool_call(
            "create_account",
            json!({"name": "Priya Sharma", "email": EMAIL, "plan": "free", "preferences": preferences()}),
        ),
    ]
}

pub fn free_tier_scenario(expected: Value) -> Scenario {
    scenario(json!({
        "id": "trajectory/free-tier",
        "eval_mode": "trajectory",
        "turns": [
            {"user_message": "Hi!", "turn_notes": "greeting"},
            {"user_message": "I'm Priya Sharma", "turn_notes": "collect_name"},
            {"user_message": EMAIL, "turn_notes": "collect_email"},
            {"user_message": "123456", "turn_notes": "verify_email"},
            {"user_message": "I'll take the free plan", "turn_notes": "select_plan"},
            {"user_message": "Email notifications and dark mode please", "turn_notes": "collect_preferences"},
            {"user_message": "What happens after this?", "turn_notes": "confirm"},
            {"user_message": "Yes, looks good", "turn_notes": "confirm"}
        ],
        "expected": expected
    }))
}

pub fn enterprise_responses() -> Vec<ScriptedResponse> {
    vec![
        ScriptedResponse::text("Hi there! What's your name?"),
        ScriptedResponse::text("NAME: Dana Okafor\nThanks Dana! What's your email?"),
        ScriptedResponse::text("A verification code is on its way to dana@example.com.")
            .with_tool_call("validate_email", json!({"email": "dana@example.com"}))
            .with_tool_call("send_verification_code", json!({"email": "dana@example.com"})),
        ScriptedResponse::text("Verified! Which plan interests you?")
            .with_tool_call("check_verification_code", json!({"email": "dana@example.com", "code": "123456"})),
        ScriptedResponse::text(
            "Enterprise is $99/month with dedicated support, unlimited projects, SSO and audit logs.",
        )
        .with_tool_call("get_plan_details", json!({"plan": "enterprise"})),
        ScriptedResponse::text("PLAN: enterprise\nExcellent. Any preferences to set up?"),
        ScriptedResponse::text(
            "PREFERENCES: {\"notifications\": \"weekly\"}\nHere's your summary. Shall I create the account?",
        ),
        ScriptedResponse::text("Done! Your enterprise account is live.").with_tool_call(
            "create_account",
            json!({"name": "Dana Okafor", "email": "dana@example.com", "plan": "enterprise"}),
        ),
    ]
}

pub fn enterprise_scenario() -> Scenario {
    scenario(json!({
        "id": "trajectory/enterprise",
        "eval_mode": "trajectory",
        "turns": [
            {"user_message": "Hello"},
            {"user_message": "Dana Okafor"},
            {"user_message": "dana@example.com"},
            {"user_message": "123456"},
            {"user_message": "What features does enterprise include?", "turn_notes": "select_plan"},
            {"user_message": "Great, enterprise it is", "turn_notes": "select_plan"},
            {"user_message": "Weekly notifications"},
            {"user_message": "Yes, create it"}
        ],
        "expected": {
            "expected_final_state": {"plan": "enterprise", "account_created": true},
            "expected_tool_counts": {"get_plan_details": 1}
        }
    }))
}

pub fn invalid_code_step() -> Scenario {
    scenario(json!({
        "id": "step/verify-invalid-code",
        "eval_mode": "step",
        "current_stage": "verify_email",
        "history": [
            {"role": "assistant", "content": "Welcome! What's your name?"},
            {"role": "user", "content": "Priya Sharma"},
            {"role": "assistant", "content": "Thanks! What's your email?"},
            {"role": "user", "content": EMAIL},
            {"role": "assistant", "content": "I've sent you a verification code."},
            {"role": "user", "content": "000000"}
        ],
        "accumulated_state": {"user_name": "Priya Sharma", "email": EMAIL},
        "expected": {
            "expected_stage": "select_plan",
            "required_tools": ["check_verification_code"],
            "expected_state": {"email_verified": true}
        }
    }))
}

pub fn invalid_code_responses() -> Vec<ScriptedResponse> {
    vec![ScriptedResponse::text("That code doesn't match. Could you check it and try again?")
        .with_tool_call("check_verification_code", json!({"email": EMAIL, "code": "000000"}))]
}

/// Responses for a scenario id, so every scenario gets a fresh script.
pub fn responses_for(id: &str) -> Vec<ScriptedResponse> {
    match id {
        "trajectory/free-tier" => free_tier_responses(),
        "trajectory/enterprise" => enterprise_responses(),
        "step/verify-invalid-code" => invalid_code_responses(),
        _ => Vec::new(),
    }
}
