mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use onboarding_eval::{
    onboarding_registry,
    providers::scripted::{ScriptedProvider, ScriptedResponse},
    EvalConfig, EvalRunner, FixedJudge, Judge, LlmJudge, LoadedScenario, ToolMode, VerdictStatus,
};
use serde_json::json;

fn runner(config: EvalConfig, judge: Arc<dyn Judge>) -> EvalRunner {
    EvalRunner::new(config, judge, &onboarding_registry(ToolMode::Mock)).expect("runner")
}

fn batch() -> Vec<LoadedScenario> {
    vec![
        LoadedScenario::Ready(enterprise_scenario()),
        LoadedScenario::Ready(invalid_code_step()),
        LoadedScenario::Ready(free_tier_scenario(json!({}))),
    ]
}

fn judgment(score: f64) -> String {
    let entry = json!({"score": score, "rationale": "steady and clear"});
    json!({"scores": {
        "tone": entry,
        "efficiency": entry,
        "repetition": entry,
        "edge_case_handling": entry
    }})
    .to_string()
}

#[tokio::test]
async fn report_is_identical_across_pool_sizes() {
    let mut reports = Vec::new();
    for concurrency in [1, 3] {
        let report = runner(
            EvalConfig::default().with_concurrency(concurrency),
            Arc::new(FixedJudge::new(0.8)),
        )
        .run(|scenario| agent_with(responses_for(&scenario.id)).0, batch())
        .await;
        reports.push(report.to_json_pretty().expect("json"));
    }
    assert_eq!(reports[0], reports[1]);

    let report = runner(EvalConfig::default(), Arc::new(FixedJudge::new(0.8)))
        .run(|scenario| agent_with(responses_for(&scenario.id)).0, batch())
        .await;
    let ids: Vec<&str> = report.records.iter().map(|r| r.scenario_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["step/verify-invalid-code", "trajectory/enterprise", "trajectory/free-tier"]
    );
    assert_eq!(report.summary.passed, 2);
    assert_eq!(report.summary.failed, 1);
    assert!(report.summary.mean_sub_scores.contains_key("no_repetition"));
}

#[tokio::test]
async fn agent_failure_is_recorded_and_the_run_continues() {
    let report = runner(EvalConfig::default(), Arc::new(FixedJudge::new(1.0)))
        .run(
            |scenario| {
                if scenario.id == "trajectory/enterprise" {
                    let mut responses = enterprise_responses();
                    responses[2] = ScriptedResponse::error("upstream returned 503");
                    agent_with(responses).0
                } else {
                    agent_with(responses_for(&scenario.id)).0
                }
            },
            batch(),
        )
        .await;

    let errored = report.record("trajectory/enterprise").expect("record");
    assert_eq!(errored.verdict.status(), VerdictStatus::Errored);
    assert!(errored.verdict.failures()[0].message.contains("turn 2"));
    assert_eq!(report.summary.errored, 1);
    assert_eq!(
        report.record("trajectory/free-tier").map(|r| r.verdict.passed()),
        Some(true)
    );
}

#[tokio::test]
async fn malformed_judgment_is_retried_once() {
    let judge_provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedResponse::text("The conversation went well overall."),
        ScriptedResponse::text(judgment(0.85)),
    ]));
    let judge = Arc::new(LlmJudge::new(judge_provider.clone(), "judge-model"));

    let report = runner(EvalConfig::default(), judge)
        .run(
            |scenario| agent_with(responses_for(&scenario.id)).0,
            vec![LoadedScenario::Ready(free_tier_scenario(json!({})))],
        )
        .await;

    let verdict = &report.records[0].verdict;
    assert!(verdict.passed());
    assert!(verdict.failures().is_empty());
    assert_eq!(verdict.rationale()["tone"], "steady and clear");
    assert_eq!(judge_provider.remaining(), 0);
}

#[tokio::test]
async fn persistent_judge_failure_fails_the_trajectory() {
    let judge_provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedResponse::error("judge overloaded"),
        ScriptedResponse::text("{\"scores\": {\"tone\": {\"score\": 1.7}}}"),
    ]));
    let judge = Arc::new(LlmJudge::new(judge_provider, "judge-model"));

    let report = runner(EvalConfig::default(), judge)
        .run(
            |scenario| agent_with(responses_for(&scenario.id)).0,
            vec![LoadedScenario::Ready(free_tier_scenario(json!({})))],
        )
        .await;

    let verdict = &report.records[0].verdict;
    assert_eq!(verdict.status(), VerdictStatus::Graded);
    assert!(!verdict.passed());
    assert_eq!(verdict.score(), 0.0);
    assert!(verdict.has_failure("judge"));
}

#[tokio::test]
async fn slow_scenario_is_cancelled() {
    let config = EvalConfig::default().with_scenario_timeout(Duration::from_millis(50));
    let report = runner(config, Arc::new(FixedJudge::new(1.0)))
        .run(
            |scenario| {
                let responses = responses_for(&scenario.id)
                    .into_iter()
                    .map(|response| response.with_latency(Duration::from_millis(30)))
                    .collect();
                agent_with(responses).0
            },
            vec![LoadedScenario::Ready(free_tier_scenario(json!({})))],
        )
        .await;

    assert_eq!(report.records[0].verdict.status(), VerdictStatus::Cancelled);
    assert_eq!(report.summary.cancelled, 1);
}
