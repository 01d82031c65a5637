//! Grades a single driven step against its expectations.

use std::collections::{BTreeMap, BTreeSet};

use regex::RegexBuilder;
use serde_json::Value;
use tracing::debug;

use crate::{
    eval::{
        judge::{JudgeClient, JudgeContext, JudgeCriterion, JudgmentRequest},
        scenario::{Expectation, ResponseCriterion},
        verdict::{Failure, Verdict},
        GradingContext,
    },
    state::{OnboardingState, Stage},
    transcript::Turn,
};

const STAGE: &str = "stage";
const TOOLS: &str = "tools";
const STATE: &str = "state";
const RESPONSE: &str = "response";

struct Check {
    category: &'static str,
    name: String,
    passed: bool,
    message: String,
    judge_error: bool,
}

impl Check {
    fn new(category: &'static str, name: impl Into<String>, passed: bool, message: String) -> Self {
        Self {
            category,
            name: name.into(),
            passed,
            message,
            judge_error: false,
        }
    }
}

fn judge_failure(name: &str, message: String) -> Check {
    let mut check = Check::new(RESPONSE, format!("judge:{name}"), false, message);
    check.judge_error = true;
    check
}

fn matches_pattern(pattern: &str, text: &str) -> Result<bool, String> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|regex| regex.is_match(text))
        .map_err(|error| error.to_string())
}

fn pattern_check(name: &str, pattern: &str, response: &str, should_match: bool) -> Check {
    match matches_pattern(pattern, response) {
        Ok(found) => Check::new(
            RESPONSE,
            name,
            found == should_match,
            if should_match {
                format!("response does not match /{pattern}/")
            } else {
                format!("response matches disallowed /{pattern}/")
            },
        ),
        Err(error) => Check::new(RESPONSE, name, false, format!("invalid pattern /{pattern}/: {error}")),
    }
}

fn state_check(state: &OnboardingState, field: &str, equals: Option<&Value>) -> Check {
    let actual = state.field(field);
    let passed = match (equals, &actual) {
        (Some(expected), Some(actual)) => expected == actual,
        (None, Some(actual)) => !actual.is_null(),
        (_, None) => false,
    };
    let shown = actual.unwrap_or(Value::Null);
    let message = match equals {
        Some(expected) => format!("state field {field}: expected {expected}, got {shown}"),
        None => format!("state field {field} is not set"),
    };
    Check::new(STATE, format!("state:{field}"), passed, message)
}

fn tool_checks(turn: &Turn, expected: &Expectation) -> Vec<Check> {
    let called: BTreeSet<&str> = turn.tool_names().collect();
    let mut checks = Vec::new();

    for tool in &expected.expected_tool_calls {
        checks.push(Check::new(
            TOOLS,
            format!("required_tool:{tool}"),
            called.contains(tool.as_str()),
            format!("required tool {tool} was not called"),
        ));
    }
    for tool in &expected.disallowed_tool_calls {
        checks.push(Check::new(
            TOOLS,
            format!("disallowed_tool:{tool}"),
            !called.contains(tool.as_str()),
            format!("disallowed tool {tool} was called"),
        ));
    }
    if let Some(allowed) = &expected.allowed_tool_calls {
        let outside: Vec<&str> = called
            .iter()
            .copied()
            .filter(|tool| !allowed.iter().any(|name| name == tool))
            .collect();
        checks.push(Check::new(
            TOOLS,
            "allowed_tools",
            outside.is_empty(),
            format!("tools outside the allowed set were called: {}", outside.join(", ")),
        ));
    }
    checks
}

/// Grades the last turn of `history` (the driven one), which arrived at
/// `arrived_at`, and the state it produced. Every check counts equally toward
/// the score; the verdict passes only when all of them pass, so a wrong stage
/// always fails.
pub async fn grade_step(
    history: &[Turn],
    arrived_at: Stage,
    state: &OnboardingState,
    expected: &Expectation,
    judge: &JudgeClient,
    ctx: &GradingContext,
) -> Verdict {
    let Some(turn) = history.last() else {
        return Verdict::graded(false, 0.0)
            .with_failures(vec![Failure::scenario("transcript", "no driven turn to grade")]);
    };

    let mut checks = Vec::new();
    let mut notes = Vec::new();
    let mut rationale = BTreeMap::new();
    let mut judged = BTreeMap::new();

    if let Some(note_stage) = turn.turn_notes.as_deref().and_then(Stage::from_note) {
        if note_stage != arrived_at {
            let message = format!("turn was expected to arrive at {note_stage} but arrived at {arrived_at}");
            if ctx.config.strict_turn_notes {
                checks.push(Check::new(STAGE, "turn_notes", false, message));
            } else {
                notes.push(message);
            }
        }
    }

    if let Some(next_stage) = expected.next_stage {
        checks.push(Check::new(
            STAGE,
            STAGE,
            state.stage == next_stage,
            format!("expected stage {next_stage}, got {}", state.stage),
        ));
    }

    checks.extend(tool_checks(turn, expected));

    for (field, value) in &expected.expected_state {
        checks.push(state_check(state, field, Some(value)));
    }

    let response = turn.agent_response.as_str();
    for criterion in &expected.response_criteria {
        let check = match criterion {
            ResponseCriterion::Contains { value } => Check::new(
                RESPONSE,
                format!("contains:{value}"),
                response.to_lowercase().contains(&value.to_lowercase()),
                format!("response does not contain '{value}'"),
            ),
            ResponseCriterion::NotContains { value } => Check::new(
                RESPONSE,
                format!("not_contains:{value}"),
                !response.to_lowercase().contains(&value.to_lowercase()),
                format!("response contains '{value}'"),
            ),
            ResponseCriterion::Regex { pattern } => pattern_check("regex", pattern, response, true),
            ResponseCriterion::NotRegex { pattern } => pattern_check("not_regex", pattern, response, false),
            ResponseCriterion::StateField { field, equals } => state_check(state, field, equals.as_ref()),
            ResponseCriterion::Judge {
                name,
                rubric,
                min_score,
            } => {
                let threshold = min_score.unwrap_or(ctx.config.pass_threshold);
                let request = JudgmentRequest {
                    criteria: vec![JudgeCriterion::new(name.clone(), rubric.clone())],
                    transcript: history.to_vec(),
                    context: JudgeContext {
                        turn_count: history.len(),
                        minimum_turns: Stage::Complete.minimum_turns_to_reach().unwrap_or_default(),
                        final_stage: state.stage,
                    },
                };
                match judge
                    .judge(&request)
                    .await
                    .map(|mut judgment| judgment.scores.remove(name))
                {
                    Ok(Some(entry)) => {
                        judged.insert(name.clone(), entry.score);
                        rationale.insert(name.clone(), entry.rationale.clone());
                        Check::new(
                            RESPONSE,
                            format!("judge:{name}"),
                            entry.score >= threshold,
                            format!("judge scored {name} {:.2}, below {threshold:.2}", entry.score),
                        )
                    }
                    Ok(None) => judge_failure(name, format!("judgment has no score for {name}")),
                    Err(error) => judge_failure(name, error.to_string()),
                }
            }
        };
        checks.push(check);
    }

    for pattern in &expected.disallowed_patterns {
        checks.push(pattern_check("disallowed_pattern", pattern, response, false));
    }

    let total = checks.len();
    let passed_count = checks.iter().filter(|check| check.passed).count();
    let score = if total == 0 {
        0.0
    } else {
        passed_count as f64 / total as f64
    };

    let mut sub_scores = BTreeMap::new();
    for category in [STAGE, TOOLS, STATE, RESPONSE] {
        let in_category: Vec<&Check> = checks.iter().filter(|c| c.category == category).collect();
        if !in_category.is_empty() {
            let passed = in_category.iter().filter(|c| c.passed).count();
            sub_scores.insert(category.to_string(), passed as f64 / in_category.len() as f64);
        }
    }
    sub_scores.extend(judged);

    let failures: Vec<Failure> = checks
        .into_iter()
        .filter(|check| !check.passed)
        .map(|check| {
            if check.judge_error {
                Failure::judge(check.name, check.message)
            } else {
                Failure::assertion(check.name, check.message)
            }
        })
        .collect();

    let passed = total > 0 && failures.is_empty();
    debug!(passed, score, failures = failures.len(), "step graded");

    Verdict::graded(passed, score)
        .with_sub_scores(sub_scores)
        .with_rationale(rationale)
        .with_failures(failures)
        .with_notes(notes)
}
