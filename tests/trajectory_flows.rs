mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use onboarding_eval::{
    eval::{
        driver::ScenarioDriver,
        judge::{FixedJudge, JudgeClient},
        step::grade_step,
        trajectory::{deterministic_checks, grade_trajectory},
        GradingContext,
    },
    onboarding_registry, EvalConfig, Plan, Stage, ToolMode,
};
use serde_json::json;

fn ctx(config: EvalConfig) -> GradingContext {
    GradingContext::new(config, &onboarding_registry(ToolMode::Mock)).expect("grading context")
}

fn judge(score: f64) -> JudgeClient {
    JudgeClient::new(Arc::new(FixedJudge::new(score)), Duration::from_secs(1))
}

fn driver(responses: Vec<onboarding_eval::providers::scripted::ScriptedResponse>) -> ScenarioDriver {
    let (agent, _) = agent_with(responses);
    ScenarioDriver::new(agent, Duration::from_secs(5))
}

#[tokio::test]
async fn free_tier_happy_path_completes_onboarding() {
    let scenario = free_tier_scenario(json!({
        "expected_final_state": {
            "user_name": "Priya Sharma",
            "email": EMAIL,
            "email_verified": true,
            "plan": "free",
            "account_created": true
        }
    }));
    let outcome = driver(free_tier_responses()).drive(&scenario).await;

    assert!(outcome.is_completed());
    assert_eq!(outcome.transcript.len(), 8);
    let state = &outcome.final_state;
    assert_eq!(state.name.as_deref(), Some("Priya Sharma"));
    assert_eq!(state.email.as_deref(), Some(EMAIL));
    assert!(state.email_verified);
    assert_eq!(state.plan, Some(Plan::Free));
    assert_eq!(state.preferences["theme"], json!("dark"));
    assert!(state.account_created);
    assert_eq!(state.stage, Stage::Complete);

    // The unclear reply at confirm re-summarizes without moving on.
    assert_eq!(outcome.transcript[6].stage, Some(Stage::Confirm));
    assert!(outcome.transcript[4].agent_response.starts_with("Great choice"));

    let ctx = ctx(EvalConfig::default().with_strict_turn_notes(true));
    let checks = deterministic_checks(&outcome.transcript, state, &scenario.expected, &ctx);
    assert!(checks.passed(), "{:?}", checks.failures);
    assert!(checks.notes.is_empty());
    assert_eq!(checks.sub_scores["correctness"], 1.0);
    assert_eq!(checks.sub_scores["turn_budget"], 1.0);

    let verdict = grade_trajectory(&outcome.transcript, state, &scenario.expected, &judge(0.9), &ctx).await;
    assert!(verdict.passed());
    assert!((verdict.score() - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn enterprise_question_stays_at_plan_selection() {
    let scenario = enterprise_scenario();
    let outcome = driver(enterprise_responses()).drive(&scenario).await;

    assert_eq!(outcome.transcript[4].stage, Some(Stage::SelectPlan));
    assert_eq!(outcome.transcript[5].stage, Some(Stage::CollectPreferences));

    let plan_lookups: Vec<usize> = outcome
        .transcript
        .iter()
        .enumerate()
        .flat_map(|(index, turn)| {
            turn.tool_names()
                .filter(|name| *name == "get_plan_details")
                .map(move |_| index)
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(plan_lookups, vec![4]);
    assert_eq!(outcome.final_state.plan, Some(Plan::Enterprise));

    let checks = deterministic_checks(
        &outcome.transcript,
        &outcome.final_state,
        &scenario.expected,
        &ctx(EvalConfig::default()),
    );
    assert!(checks.passed(), "{:?}", checks.failures);
}

#[tokio::test]
async fn invalid_code_step_stays_at_verification() {
    let scenario = invalid_code_step();
    let outcome = driver(invalid_code_responses()).drive(&scenario).await;

    assert_eq!(outcome.driven_turns().len(), 1);
    assert_eq!(outcome.final_state.stage, Stage::VerifyEmail);
    assert!(!outcome.final_state.email_verified);

    let verdict = grade_step(
        &outcome.transcript,
        scenario.initial_state().stage,
        &outcome.final_state,
        &scenario.expected,
        &judge(1.0),
        &ctx(EvalConfig::default()),
    )
    .await;
    assert!(!verdict.passed());
    assert!(verdict.has_failure("stage"));
    assert!(verdict.has_failure("state:email_verified"));
    assert_eq!(verdict.sub_scores()["tools"], 1.0);
}

#[tokio::test]
async fn deterministic_checks_are_idempotent_over_a_driven_run() {
    let scenario = free_tier_scenario(json!({}));
    let outcome = driver(free_tier_responses()).drive(&scenario).await;
    let ctx = ctx(EvalConfig::default());

    let first = deterministic_checks(&outcome.transcript, &outcome.final_state, &scenario.expected, &ctx);
    let second = deterministic_checks(&outcome.transcript, &outcome.final_state, &scenario.expected, &ctx);
    assert_eq!(first, second);
}

#[tokio::test]
async fn deterministic_failure_beats_a_perfect_judge() {
    let scenario = free_tier_scenario(json!({
        "expected_tool_counts": {"check_verification_code": 2}
    }));
    let outcome = driver(free_tier_responses()).drive(&scenario).await;

    let verdict = grade_trajectory(
        &outcome.transcript,
        &outcome.final_state,
        &scenario.expected,
        &judge(1.0),
        &ctx(EvalConfig::default()),
    )
    .await;

    assert!(!verdict.passed());
    assert_eq!(verdict.score(), 1.0);
    assert!(verdict.has_failure("tool_counts"));
    assert_eq!(verdict.sub_scores()["edge_case_handling"], 1.0);
}

#[tokio::test]
async fn change_request_at_confirm_goes_back_to_plans() {
    let mut responses = free_tier_responses();
    responses.truncate(6);
    responses.push(onboarding_eval::providers::scripted::ScriptedResponse::text(
        "No problem, let's pick a different plan.",
    ));

    let scenario = common::scenario(json!({
        "eval_mode": "trajectory",
        "turns": [
            {"user_message": "Hi!"},
            {"user_message": "I'm Priya Sharma"},
            {"user_message": EMAIL},
            {"user_message": "123456"},
            {"user_message": "free"},
            {"user_message": "dark mode"},
            {"user_message": "Actually I want to change my plan"}
        ],
        "expected": {"require_completion": false}
    }));
    let outcome = driver(responses).drive(&scenario).await;

    assert_eq!(outcome.final_state.stage, Stage::SelectPlan);
    let checks = deterministic_checks(
        &outcome.transcript,
        &outcome.final_state,
        &scenario.expected,
        &ctx(EvalConfig::default()),
    );
    assert!(checks.passed(), "{:?}", checks.failures);
}
