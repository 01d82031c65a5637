//! Trajectory grading: a pure deterministic pass over the whole transcript
//! followed by one judged pass, merged into a single verdict.

use std::collections::{BTreeMap, BTreeSet};

use strsim::normalized_levenshtein;
use tracing::debug;

use crate::{
    eval::{
        judge::{weighted_mean, JudgeClient, JudgeContext, JudgmentRequest},
        scenario::Expectation,
        verdict::{Failure, Verdict},
        GradingContext,
    },
    state::{OnboardingState, Stage},
    tools::CHECK_VERIFICATION_CODE,
    transcript::Turn,
};

/// Result of the deterministic pass. `sub_scores` are diagnostics only and
/// never decide pass/fail.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicOutcome {
    pub failures: Vec<Failure>,
    pub notes: Vec<String>,
    pub sub_scores: BTreeMap<String, f64>,
}

impl DeterministicOutcome {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Share of consecutive agent messages that are not near-duplicates.
pub fn no_repetition_score(messages: &[&str], threshold: f64) -> f64 {
    if messages.len() <= 1 {
        return 1.0;
    }
    let repeated = messages
        .windows(2)
        .filter(|pair| normalized_levenshtein(pair[0], pair[1]) > threshold)
        .count();
    1.0 - repeated as f64 / (messages.len() - 1) as f64
}

/// 1.0 within budget, then 0.2 less per extra turn.
pub fn turn_budget_score(turns: usize, max_turns: usize) -> f64 {
    if turns <= max_turns {
        1.0
    } else {
        (1.0 - (turns - max_turns) as f64 / 5.0).max(0.0)
    }
}

pub fn deterministic_checks(
    transcript: &[Turn],
    final_state: &OnboardingState,
    expected: &Expectation,
    ctx: &GradingContext,
) -> DeterministicOutcome {
    let config = &ctx.config;
    let mut failures = Vec::new();
    let mut notes = Vec::new();
    let mut sub_scores = BTreeMap::new();

    for violation in final_state.invariant_violations() {
        failures.push(Failure::assertion("state_invariants", violation.to_string()));
    }

    if expected.require_completion {
        let missing = final_state.missing_required_fields();
        if !missing.is_empty() {
            failures.push(Failure::assertion(
                "required_fields",
                format!("missing required fields: {}", missing.join(", ")),
            ));
        }
        if !final_state.account_created {
            failures.push(Failure::assertion("account_created", "account was never created"));
        }
    }

    let mut previous = Stage::Greeting;
    for (index, turn) in transcript.iter().enumerate() {
        if let Some(note_stage) = turn.turn_notes.as_deref().and_then(Stage::from_note) {
            if note_stage != previous {
                let message = format!(
                    "turn {index} was expected to arrive at {note_stage} but arrived at {previous}"
                );
                if config.strict_turn_notes {
                    failures.push(Failure::assertion("turn_notes", message));
                } else {
                    notes.push(message);
                }
            }
        }
        if let Some(stage) = turn.stage {
            if !previous.can_transition_to(stage) {
                failures.push(Failure::assertion(
                    "stage_transitions",
                    format!("turn {index} moved from {previous} to {stage}"),
                ));
            }
            previous = stage;
        }
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, turn) in transcript.iter().enumerate() {
        for call in &turn.tool_calls {
            *counts.entry(call.name.as_str()).or_default() += 1;
            if !ctx.validator.knows(&call.name) {
                failures.push(Failure::assertion(
                    "unknown_tool",
                    format!("turn {index} called unknown tool {}", call.name),
                ));
            } else if let Err(errors) = ctx.validator.validate(&call.name, &call.arguments) {
                failures.push(Failure::assertion(
                    "tool_arguments",
                    format!("turn {index} {}: {}", call.name, errors.join("; ")),
                ));
            }
        }
    }

    let attempts = counts.get(CHECK_VERIFICATION_CODE).copied().unwrap_or(0);
    if attempts > config.max_verification_attempts {
        failures.push(Failure::assertion(
            "verification_attempts",
            format!(
                "{attempts} verification attempts, at most {} allowed",
                config.max_verification_attempts
            ),
        ));
    }

    let called: BTreeSet<&str> = counts.keys().copied().collect();
    for tool in &expected.expected_tool_calls {
        if !called.contains(tool.as_str()) {
            failures.push(Failure::assertion(
                "required_tools",
                format!("required tool {tool} was never called"),
            ));
        }
    }
    for tool in &expected.disallowed_tool_calls {
        if called.contains(tool.as_str()) {
            failures.push(Failure::assertion(
                "disallowed_tools",
                format!("disallowed tool {tool} was called"),
            ));
        }
    }

    for (tool, expected_count) in &expected.expected_tool_counts {
        let actual = counts.get(tool.as_str()).copied().unwrap_or(0);
        if actual != *expected_count {
            failures.push(Failure::assertion(
                "tool_counts",
                format!("{tool} called {actual} time(s), expected {expected_count}"),
            ));
        }
    }

    if !expected.expected_final_state.is_empty() {
        let mut matched = 0;
        for (field, value) in &expected.expected_final_state {
            match final_state.field(field) {
                Some(actual) if &actual == value => matched += 1,
                actual => failures.push(Failure::assertion(
                    "final_state",
                    format!(
                        "final {field}: expected {value}, got {}",
                        actual.unwrap_or(serde_json::Value::Null)
                    ),
                )),
            }
        }
        sub_scores.insert(
            "correctness".to_string(),
            matched as f64 / expected.expected_final_state.len() as f64,
        );
    }

    let max_turns = expected.max_turns.unwrap_or(config.default_max_turns);
    sub_scores.insert(
        "turn_budget".to_string(),
        turn_budget_score(transcript.len(), max_turns),
    );

    let messages: Vec<&str> = transcript.iter().map(|turn| turn.agent_response.as_str()).collect();
    sub_scores.insert(
        "no_repetition".to_string(),
        no_repetition_score(&messages, config.repetition_similarity),
    );

    DeterministicOutcome {
        failures,
        notes,
        sub_scores,
    }
}

/// Runs both passes and merges them. Any deterministic failure fails the
/// verdict; otherwise the weighted judged mean must reach the threshold. The
/// score is the weighted judged mean.
pub async fn grade_trajectory(
    transcript: &[Turn],
    final_state: &OnboardingState,
    expected: &Expectation,
    judge: &JudgeClient,
    ctx: &GradingContext,
) -> Verdict {
    let DeterministicOutcome {
        mut failures,
        notes,
        mut sub_scores,
    } = deterministic_checks(transcript, final_state, expected, ctx);
    let deterministic_passed = failures.is_empty();
    let criteria = &ctx.config.criteria;
    let mut rationale = BTreeMap::new();

    let (judged_passed, score) = if criteria.is_empty() {
        (true, if deterministic_passed { 1.0 } else { 0.0 })
    } else {
        let request = JudgmentRequest {
            criteria: criteria.clone(),
            transcript: transcript.to_vec(),
            context: JudgeContext {
                turn_count: transcript.len(),
                minimum_turns: Stage::Complete.minimum_turns_to_reach().unwrap_or_default(),
                final_stage: final_state.stage,
            },
        };
        match judge.judge(&request).await {
            Ok(judgment) => {
                let mean = weighted_mean(criteria, &judgment);
                for (name, entry) in judgment.scores {
                    if criteria.iter().any(|criterion| criterion.name == name) {
                        sub_scores.insert(name.clone(), entry.score);
                        rationale.insert(name, entry.rationale);
                    }
                }
                (mean >= ctx.config.pass_threshold, mean)
            }
            Err(error) => {
                failures.push(Failure::judge("judge", error.to_string()));
                (false, 0.0)
            }
        }
    };

    let passed = deterministic_passed && judged_passed;
    debug!(passed, score, failures = failures.len(), "trajectory graded");

    Verdict::graded(passed, score)
        .with_sub_scores(sub_scores)
        .with_rationale(rationale)
        .with_failures(failures)
        .with_notes(notes)
}
