//! LLM-as-judge capability: the trait, an LLM-backed implementation, a
//! fixed-score stub and the retrying client the graders call through.

use std::{collections::BTreeMap, fmt::Write as _, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time;
use tracing::{debug, warn};

use crate::{
    eval::extract_json_block,
    state::Stage,
    transcript::Turn,
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error("judge did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed judgment: {0}")]
    Malformed(String),
    #[error("judge unavailable: {0}")]
    Unavailable(String),
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeCriterion {
    pub name: String,
    pub rubric: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl JudgeCriterion {
    pub fn new(name: impl Into<String>, rubric: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rubric: rubric.into(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Criteria used for trajectories when the configuration names none.
    pub fn defaults() -> Vec<JudgeCriterion> {
        vec![
            JudgeCriterion::new(
                "tone",
                "Was the agent professional, warm, and helpful throughout? Deduct for \
                 robotic/scripted feel, condescension, or excessive formality.",
            ),
            JudgeCriterion::new(
                "efficiency",
                "Did the agent move the user through onboarding without unnecessary turns, \
                 compared with the minimum number of turns required?",
            ),
            JudgeCriterion::new(
                "repetition",
                "Did the agent avoid re-asking for information it already had and avoid \
                 repeating itself?",
            ),
            JudgeCriterion::new(
                "edge_case_handling",
                "When the user did something unexpected (off-topic, changed mind, gave \
                 ambiguous input), did the agent handle it smoothly without losing context?",
            ),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgeContext {
    pub turn_count: usize,
    pub minimum_turns: usize,
    pub final_stage: Stage,
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgmentRequest {
    pub criteria: Vec<JudgeCriterion>,
    pub transcript: Vec<Turn>,
    pub context: JudgeContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Judgment {
    pub scores: BTreeMap<String, CriterionScore>,
}

impl Judgment {
    /// Every requested criterion must be present with a finite score in
    /// `[0, 1]`.
    pub fn validate(&self, criteria: &[JudgeCriterion]) -> Result<(), JudgeError> {
        for criterion in criteria {
            let Some(entry) = self.scores.get(&criterion.name) else {
                return Err(JudgeError::Malformed(format!(
                    "missing criterion '{}'",
                    criterion.name
                )));
            };
            if !entry.score.is_finite() || !(0.0..=1.0).contains(&entry.score) {
                return Err(JudgeError::Malformed(format!(
                    "criterion '{}' scored {} outside [0, 1]",
                    criterion.name, entry.score
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgeError>;

    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<(), JudgeError> {
        Ok(())
    }
}

/// Judge backed by a chat completion in JSON mode.
pub struct LlmJudge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn system_prompt(criteria: &[JudgeCriterion]) -> String {
        let mut prompt = String::from(
            "You are an evaluation judge for an account onboarding assistant. Rate the \
             conversation on each criterion below with a score between 0.0 and 1.0 and a \
             one-sentence rationale.\n\nCriteria:\n",
        );
        for criterion in criteria {
            let _ = writeln!(prompt, "- {}: {}", criterion.name, criterion.rubric);
        }
        prompt.push_str(
            "\nRespond with JSON only, shaped as \
             {\"scores\": {\"<criterion>\": {\"score\": <number>, \"rationale\": \"<text>\"}}}.",
        );
        prompt
    }

    fn conversation(request: &JudgmentRequest) -> String {
        let mut text = format!(
            "Turns taken: {} (minimum required: {}). Final stage: {}.\n\n",
            request.context.turn_count, request.context.minimum_turns, request.context.final_stage
        );
        for turn in &request.transcript {
            let _ = writeln!(text, "User: {}", turn.user_message);
            for call in &turn.tool_calls {
                let _ = writeln!(text, "[tool {} {}]", call.name, call.arguments);
            }
            let _ = writeln!(text, "Agent: {}", turn.agent_response);
        }
        text
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgeError> {
        let completion = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(Self::system_prompt(&request.criteria)),
                ChatMessage::user(Self::conversation(request)),
            ],
        )
        .with_temperature(self.temperature)
        .with_response_format(json!({"type": "json_object"}));

        let response = self.provider.complete(completion).await?;
        let content = response.message.text().unwrap_or_default();
        let body = extract_json_block(content).unwrap_or(content.trim());
        serde_json::from_str(body).map_err(|error| JudgeError::Malformed(error.to_string()))
    }

    fn name(&self) -> &str {
        "llm-judge"
    }

    async fn health_check(&self) -> Result<(), JudgeError> {
        let ping = CompletionRequest::new(self.model.clone(), vec![ChatMessage::user("ping")])
            .with_max_tokens(1);
        self.provider
            .complete(ping)
            .await
            .map(|_| ())
            .map_err(|error| JudgeError::Unavailable(format!("{}: {error}", self.provider.name())))
    }
}

/// Scores every requested criterion with a preset value.
#[derive(Debug, Clone)]
pub struct FixedJudge {
    default_score: f64,
    overrides: BTreeMap<String, f64>,
}

impl FixedJudge {
    pub fn new(default_score: f64) -> Self {
        Self {
            default_score,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_score(mut self, criterion: impl Into<String>, score: f64) -> Self {
        self.overrides.insert(criterion.into(), score);
        self
    }
}

#[async_trait]
impl Judge for FixedJudge {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgeError> {
        let scores = request
            .criteria
            .iter()
            .map(|criterion| {
                let score = self
                    .overrides
                    .get(&criterion.name)
                    .copied()
                    .unwrap_or(self.default_score);
                (
                    criterion.name.clone(),
                    CriterionScore {
                        score,
                        rationale: "fixed score".to_string(),
                    },
                )
            })
            .collect();
        Ok(Judgment { scores })
    }

    fn name(&self) -> &str {
        "fixed-judge"
    }
}

/// A failed or malformed judgment is retried exactly this many times.
const JUDGE_RETRIES: u32 = 1;

/// Calls a judge with a timeout, validates the answer and retries once with
/// the same request.
#[derive(Clone)]
pub struct JudgeClient {
    judge: Arc<dyn Judge>,
    timeout: Duration,
}

impl JudgeClient {
    pub fn new(judge: Arc<dyn Judge>, timeout: Duration) -> Self {
        Self { judge, timeout }
    }

    pub fn name(&self) -> &str {
        self.judge.name()
    }

    pub async fn health_check(&self) -> Result<(), JudgeError> {
        time::timeout(self.timeout, self.judge.health_check())
            .await
            .map_err(|_| JudgeError::Timeout(self.timeout))?
    }

    pub async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgeError> {
        let mut attempt = 0;
        loop {
            let result = match time::timeout(self.timeout, self.judge.judge(request)).await {
                Ok(Ok(judgment)) => judgment.validate(&request.criteria).map(|()| judgment),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(JudgeError::Timeout(self.timeout)),
            };

            match result {
                Ok(judgment) => {
                    debug!(judge = self.judge.name(), attempt, "judgment accepted");
                    return Ok(judgment);
                }
                Err(error) if attempt < JUDGE_RETRIES => {
                    warn!(judge = self.judge.name(), attempt, %error, "judge failed, retrying");
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Weighted mean of the judged scores; weights are normalized and an
/// all-zero weighting falls back to equal weights.
pub fn weighted_mean(criteria: &[JudgeCriterion], judgment: &Judgment) -> f64 {
    let scored: Vec<(f64, f64)> = criteria
        .iter()
        .filter_map(|criterion| {
            judgment
                .scores
                .get(&criterion.name)
                .map(|entry| (criterion.weight.max(0.0), entry.score))
        })
        .collect();
    if scored.is_empty() {
        return 0.0;
    }

    let total_weight: f64 = scored.iter().map(|(weight, _)| weight).sum();
    if total_weight <= 0.0 {
        return scored.iter().map(|(_, score)| score).sum::<f64>() / scored.len() as f64;
    }
    scored
        .iter()
        .map(|(weight, score)| weight / total_weight * score)
        .sum()
}
