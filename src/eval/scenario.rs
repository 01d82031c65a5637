//! Scenario files: the data model, validation, and loading from disk.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    eval::extract_json_block,
    state::{OnboardingState, Stage},
    transcript::Turn,
};

pub const INSTRUCTION_FILE: &str = "instruction.md";
pub const EXPECTED_FILE: &str = "expected.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    Step,
    Trajectory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioTurn {
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_notes: Option<String>,
}

impl ScenarioTurn {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            turn_notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.turn_notes = Some(notes.into());
        self
    }
}

/// A check on the agent's reply for the driven step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseCriterion {
    Contains {
        value: String,
    },
    NotContains {
        value: String,
    },
    Regex {
        pattern: String,
    },
    NotRegex {
        pattern: String,
    },
    /// Present when `equals` is absent, equal otherwise.
    StateField {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equals: Option<Value>,
    },
    Judge {
        name: String,
        rubric: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_score: Option<f64>,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    #[serde(default, alias = "expected_stage", skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<Stage>,
    #[serde(default, alias = "required_tools", skip_serializing_if = "Vec::is_empty")]
    pub expected_tool_calls: Vec<String>,
    #[serde(default, alias = "disallowed_tools", skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tool_calls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tool_calls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expected_state: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_criteria: Vec<ResponseCriterion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expected_final_state: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expected_tool_counts: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,
    #[serde(default = "default_true")]
    pub require_completion: bool,
}

impl Default for Expectation {
    fn default() -> Self {
        Self {
            next_stage: None,
            expected_tool_calls: Vec::new(),
            disallowed_tool_calls: Vec::new(),
            allowed_tool_calls: None,
            expected_state: BTreeMap::new(),
            response_criteria: Vec::new(),
            disallowed_patterns: Vec::new(),
            expected_final_state: BTreeMap::new(),
            expected_tool_counts: BTreeMap::new(),
            max_turns: None,
            require_completion: true,
        }
    }
}

/// A history entry as written in a file: either a full turn or a bare
/// chat message.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HistoryEntry {
    Turn(Turn),
    Message { role: String, content: String },
}

#[derive(Debug, Clone, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    description: Option<String>,
    eval_mode: EvalMode,
    #[serde(default)]
    turns: Vec<ScenarioTurn>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default, alias = "accumulated_state")]
    state: Option<OnboardingState>,
    #[serde(default)]
    current_stage: Option<Stage>,
    #[serde(default)]
    expected: Expectation,
}

/// A validated scenario. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub eval_mode: EvalMode,
    pub turns: Vec<ScenarioTurn>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<OnboardingState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub expected: Expectation,
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{0} has no JSON block")]
    MissingJson(PathBuf),
    #[error("unsupported scenario file {0}")]
    UnsupportedFile(PathBuf),
    #[error("scenario has no turns")]
    NoTurns,
    #[error("step scenarios drive exactly one turn, found {0}")]
    StepTurnCount(usize),
    #[error("step scenario does not name the expected next stage")]
    MissingNextStage,
    #[error("trajectory scenarios start from an empty state and carry no history")]
    TrajectoryInjection,
    #[error("history ends with an unanswered user message while turns are also given")]
    DanglingHistory,
    #[error("injected state is inconsistent: {0}")]
    InvalidState(String),
    #[error("injected state is at {state} but history ends at {history}")]
    StageMismatch { state: Stage, history: Stage },
    #[error("history moves illegally from {from} to {to}")]
    IllegalHistory { from: Stage, to: Stage },
    #[error("turn notes move illegally from {from} to {to}")]
    IllegalNotes { from: Stage, to: Stage },
    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl Scenario {
    /// Builds and validates a scenario from its JSON form. `fallback_id` is
    /// used when the document carries no `id`.
    pub fn from_json_str(input: &str, fallback_id: &str) -> Result<Self, ScenarioError> {
        let file: ScenarioFile =
            serde_json::from_str(input).map_err(|error| ScenarioError::Parse {
                path: PathBuf::from(fallback_id),
                message: error.to_string(),
            })?;
        Self::from_file(file, fallback_id)
    }

    fn from_file(file: ScenarioFile, fallback_id: &str) -> Result<Self, ScenarioError> {
        let (history, pending) = normalize_history(file.history);
        let mut turns = file.turns;
        if let Some(user_message) = pending {
            if !turns.is_empty() {
                return Err(ScenarioError::DanglingHistory);
            }
            turns.push(ScenarioTurn::new(user_message));
        }

        let scenario = Self {
            id: file
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| fallback_id.to_string()),
            description: file.description,
            eval_mode: file.eval_mode,
            turns,
            history,
            state: file.state,
            current_stage: file.current_stage,
            expected: file.expected,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    /// State the driver starts from.
    pub fn initial_state(&self) -> OnboardingState {
        match self.eval_mode {
            EvalMode::Trajectory => OnboardingState::new(),
            EvalMode::Step => {
                let mut state = self.state.clone().unwrap_or_default();
                if let Some(stage) = self.current_stage {
                    state.stage = stage;
                }
                state
            }
        }
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.turns.is_empty() {
            return Err(ScenarioError::NoTurns);
        }

        match self.eval_mode {
            EvalMode::Step => {
                if self.turns.len() != 1 {
                    return Err(ScenarioError::StepTurnCount(self.turns.len()));
                }
                if self.expected.next_stage.is_none() {
                    return Err(ScenarioError::MissingNextStage);
                }
            }
            EvalMode::Trajectory => {
                if !self.history.is_empty() || self.state.is_some() || self.current_stage.is_some() {
                    return Err(ScenarioError::TrajectoryInjection);
                }
            }
        }

        let state = self.initial_state();
        let violations = state.invariant_violations();
        if !violations.is_empty() {
            let described: Vec<String> = violations.iter().map(ToString::to_string).collect();
            return Err(ScenarioError::InvalidState(described.join("; ")));
        }

        let history_stages: Vec<Stage> = self.history.iter().filter_map(|turn| turn.stage).collect();
        check_sequence(&history_stages, |from, to| ScenarioError::IllegalHistory { from, to })?;
        if let Some(&last) = history_stages.last() {
            if last != state.stage {
                return Err(ScenarioError::StageMismatch {
                    state: state.stage,
                    history: last,
                });
            }
        }

        let note_stages: Vec<Stage> = self
            .turns
            .iter()
            .filter_map(|turn| turn.turn_notes.as_deref().and_then(Stage::from_note))
            .collect();
        check_sequence(&note_stages, |from, to| ScenarioError::IllegalNotes { from, to })?;

        let patterns = self
            .expected
            .disallowed_patterns
            .iter()
            .chain(self.expected.response_criteria.iter().filter_map(|criterion| match criterion {
                ResponseCriterion::Regex { pattern } | ResponseCriterion::NotRegex { pattern } => {
                    Some(pattern)
                }
                _ => None,
            }));
        for pattern in patterns {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|error| ScenarioError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: error.to_string(),
                })?;
        }

        Ok(())
    }
}

fn check_sequence(
    stages: &[Stage],
    error: impl Fn(Stage, Stage) -> ScenarioError,
) -> Result<(), ScenarioError> {
    for pair in stages.windows(2) {
        if !pair[0].can_transition_to(pair[1]) {
            return Err(error(pair[0], pair[1]));
        }
    }
    Ok(())
}

/// Folds file history into turns. A trailing user message with no reply is
/// returned separately: it is the message to drive.
fn normalize_history(entries: Vec<HistoryEntry>) -> (Vec<Turn>, Option<String>) {
    let mut turns = Vec::new();
    let mut pending: Option<String> = None;

    let unanswered = |user_message: String| Turn {
        user_message,
        turn_notes: None,
        agent_response: String::new(),
        tool_calls: Vec::new(),
        stage: None,
    };

    for entry in entries {
        match entry {
            HistoryEntry::Turn(turn) => {
                if let Some(user_message) = pending.take() {
                    turns.push(unanswered(user_message));
                }
                turns.push(turn);
            }
            HistoryEntry::Message { role, content } => match role.as_str() {
                "user" => {
                    if let Some(user_message) = pending.replace(content) {
                        turns.push(unanswered(user_message));
                    }
                }
                "assistant" => {
                    let mut turn = unanswered(pending.take().unwrap_or_default());
                    turn.agent_response = content;
                    turns.push(turn);
                }
                _ => {}
            },
        }
    }

    (turns, pending)
}

/// Outcome of loading one scenario source.
#[derive(Debug)]
pub enum LoadedScenario {
    Ready(Scenario),
    Malformed {
        id: String,
        eval_mode: Option<EvalMode>,
        error: ScenarioError,
    },
}

impl LoadedScenario {
    pub fn id(&self) -> &str {
        match self {
            LoadedScenario::Ready(scenario) => &scenario.id,
            LoadedScenario::Malformed { id, .. } => id,
        }
    }
}

fn read(path: &Path) -> Result<String, ScenarioError> {
    fs::read_to_string(path).map_err(|source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_error(path: &Path, error: impl ToString) -> ScenarioError {
    ScenarioError::Parse {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

fn parse_document(path: &Path) -> Result<ScenarioFile, ScenarioError> {
    let text = read(path)?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match extension.as_str() {
        "json" => serde_json::from_str(&text).map_err(|e| parse_error(path, e)),
        "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| parse_error(path, e)),
        "md" | "txt" => {
            let body = match extract_json_block(&text) {
                Some(body) => body,
                None if text.trim_start().starts_with('{') => text.trim(),
                None => return Err(ScenarioError::MissingJson(path.to_path_buf())),
            };
            serde_json::from_str(body).map_err(|e| parse_error(path, e))
        }
        _ => Err(ScenarioError::UnsupportedFile(path.to_path_buf())),
    }
}

/// `eval_mode` from a document that otherwise failed, for the report.
fn sniff_mode(path: &Path) -> Option<EvalMode> {
    let text = fs::read_to_string(path).ok()?;
    if text.contains("\"trajectory\"") || text.contains("eval_mode: trajectory") {
        Some(EvalMode::Trajectory)
    } else if text.contains("\"step\"") || text.contains("eval_mode: step") {
        Some(EvalMode::Step)
    } else {
        None
    }
}

fn load_document(path: &Path, fallback_id: &str, expected: Option<&Path>) -> LoadedScenario {
    let result = parse_document(path).and_then(|mut file| {
        if let Some(expected_path) = expected {
            let text = read(expected_path)?;
            file.expected =
                serde_json::from_str(&text).map_err(|e| parse_error(expected_path, e))?;
        }
        Scenario::from_file(file, fallback_id)
    });

    match result {
        Ok(scenario) => {
            debug!(id = %scenario.id, mode = ?scenario.eval_mode, "scenario loaded");
            LoadedScenario::Ready(scenario)
        }
        Err(error) => {
            warn!(id = fallback_id, %error, "malformed scenario");
            LoadedScenario::Malformed {
                id: fallback_id.to_string(),
                eval_mode: sniff_mode(path),
                error,
            }
        }
    }
}

/// Loads a task directory: `instruction.md` plus an optional
/// `expected.json` that replaces the inline expectations.
pub fn load_task_dir(dir: &Path, id: &str) -> LoadedScenario {
    let expected = dir.join(EXPECTED_FILE);
    let expected = expected.is_file().then_some(expected.as_path());
    load_document(&dir.join(INSTRUCTION_FILE), id, expected)
}

fn is_scenario_file(path: &Path) -> bool {
    let supported = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("json" | "yaml" | "yml" | "md" | "txt")
    );
    supported && path.file_name().and_then(|name| name.to_str()) != Some(EXPECTED_FILE)
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .with_extension("")
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<LoadedScenario>) -> Result<(), ScenarioError> {
    let io_error = |source| ScenarioError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir)
        .map_err(io_error)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if path.join(INSTRUCTION_FILE).is_file() {
                out.push(load_task_dir(&path, &relative_id(root, &path)));
            } else {
                collect(root, &path, out)?;
            }
        } else if is_scenario_file(&path) {
            out.push(load_document(&path, &relative_id(root, &path), None));
        }
    }
    Ok(())
}

/// Loads a scenario file, a task directory, or a directory tree of either.
/// Results are sorted by id. Only an unreadable `path` is an error; broken
/// individual scenarios come back as [`LoadedScenario::Malformed`].
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<LoadedScenario>, ScenarioError> {
    let path = path.as_ref();
    let mut loaded = Vec::new();

    if path.is_file() {
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        loaded.push(load_document(path, &id, None));
    } else if path.join(INSTRUCTION_FILE).is_file() {
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        loaded.push(load_task_dir(path, &id));
    } else if path.is_dir() {
        collect(path, path, &mut loaded)?;
    } else {
        return Err(ScenarioError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
        });
    }

    loaded.sort_by(|a, b| a.id().cmp(b.id()));
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> Result<Scenario, ScenarioError> {
        Scenario::from_json_str(&value.to_string(), "fallback")
    }

    #[test]
    fn chat_history_becomes_turns_with_the_last_user_message_driven() {
        let scenario = step(json!({
            "eval_mode": "step",
            "current_stage": "collect_email",
            "history": [
                {"role": "assistant", "content": "Welcome! What's your name?"},
                {"role": "user", "content": "Hi there, my name is Walker Thompson"},
                {"role": "assistant", "content": "NAME: Walker Thompson\nGreat! Your email?"},
                {"role": "user", "content": "Sure, it's walker@example.com"}
            ],
            "accumulated_state": {"user_name": "Walker Thompson"},
            "expected": {"expected_stage": "verify_email", "required_tools": ["validate_email"]}
        }))
        .expect("scenario");

        assert_eq!(scenario.id, "fallback");
        assert_eq!(scenario.history.len(), 2);
        assert_eq!(scenario.history[0].user_message, "");
        assert_eq!(scenario.turns, vec![ScenarioTurn::new("Sure, it's walker@example.com")]);
        assert_eq!(scenario.initial_state().stage, Stage::CollectEmail);
        assert_eq!(scenario.expected.expected_tool_calls, vec!["validate_email"]);
        assert!(scenario.expected.require_completion);
    }

    #[test]
    fn step_requires_next_stage_and_one_turn() {
        let missing = step(json!({"eval_mode": "step", "turns": [{"user_message": "hi"}]}));
        assert!(matches!(missing, Err(ScenarioError::MissingNextStage)));

        let two = step(json!({
            "eval_mode": "step",
            "turns": [{"user_message": "a"}, {"user_message": "b"}],
            "expected": {"next_stage": "collect_name"}
        }));
        assert!(matches!(two, Err(ScenarioError::StepTurnCount(2))));
    }

    #[test]
    fn trajectory_rejects_injected_state() {
        let result = step(json!({
            "eval_mode": "trajectory",
            "turns": [{"user_message": "hi"}],
            "state": {"current_stage": "confirm"}
        }));
        assert!(matches!(result, Err(ScenarioError::TrajectoryInjection)));
    }

    #[test]
    fn rejects_inconsistent_injected_state() {
        let result = step(json!({
            "eval_mode": "step",
            "turns": [{"user_message": "pro please"}],
            "state": {"current_stage": "select_plan", "plan": "pro"},
            "expected": {"next_stage": "collect_preferences"}
        }));
        assert!(matches!(result, Err(ScenarioError::InvalidState(_))));
    }

    #[test]
    fn rejects_illegal_note_sequences() {
        let result = step(json!({
            "eval_mode": "trajectory",
            "turns": [
                {"user_message": "hi", "turn_notes": "greeting"},
                {"user_message": "free plan", "turn_notes": "select_plan"}
            ]
        }));
        assert!(matches!(
            result,
            Err(ScenarioError::IllegalNotes { from: Stage::Greeting, to: Stage::SelectPlan })
        ));
    }

    #[test]
    fn rejects_history_that_disagrees_with_state() {
        let result = step(json!({
            "eval_mode": "step",
            "history": [{"user_message": "hi", "agent_response": "name?", "stage": "collect_name"}],
            "turns": [{"user_message": "Priya"}],
            "state": {"current_stage": "collect_email", "user_name": "Priya"},
            "expected": {"next_stage": "verify_email"}
        }));
        assert!(matches!(result, Err(ScenarioError::StageMismatch { .. })));
    }

    #[test]
    fn rejects_bad_patterns() {
        let result = step(json!({
            "eval_mode": "step",
            "turns": [{"user_message": "hi"}],
            "expected": {"next_stage": "collect_name", "disallowed_patterns": ["(unclosed"]}
        }));
        assert!(matches!(result, Err(ScenarioError::InvalidPattern { .. })));
    }

    #[test]
    fn loads_directory_tree_sorted_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();

        fs::write(
            root.join("b-trajectory.yaml"),
            "eval_mode: trajectory\nturns:\n  - user_message: hi\n",
        )
        .expect("yaml");

        let task = root.join("step").join("gen-000");
        fs::create_dir_all(&task).expect("task dir");
        fs::write(
            task.join(INSTRUCTION_FILE),
            "Drive one step.\n\n```json\n{\"eval_mode\": \"step\", \"turns\": [{\"user_message\": \"hi\"}]}\n```\n",
        )
        .expect("instruction");
        fs::write(task.join(EXPECTED_FILE), "{\"expected_stage\": \"collect_name\"}").expect("expected");

        fs::write(root.join("a-broken.json"), "{\"eval_mode\": \"step\"").expect("broken");
        fs::write(root.join("notes.toml"), "ignored = true").expect("toml");

        let loaded = load_scenarios(root).expect("load");
        let ids: Vec<&str> = loaded.iter().map(LoadedScenario::id).collect();
        assert_eq!(ids, vec!["a-broken", "b-trajectory", "step/gen-000"]);

        assert!(matches!(
            &loaded[0],
            LoadedScenario::Malformed { eval_mode: Some(EvalMode::Step), .. }
        ));
        match &loaded[2] {
            LoadedScenario::Ready(scenario) => {
                assert_eq!(scenario.expected.next_stage, Some(Stage::CollectName));
            }
            other => panic!("expected a ready scenario, got {other:?}"),
        }
    }

    #[test]
    fn missing_path_is_an_error() {
        assert!(load_scenarios("/definitely/not/here").is_err());
    }
}
