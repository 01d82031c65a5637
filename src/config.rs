use std::{collections::BTreeSet, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{eval::judge::JudgeCriterion, tools::ToolMode, EvalError};

fn default_concurrency() -> usize {
    4
}

fn default_agent_timeout_ms() -> u64 {
    60_000
}

fn default_judge_timeout_ms() -> u64 {
    60_000
}

fn default_pass_threshold() -> f64 {
    0.7
}

fn default_max_verification_attempts() -> usize {
    3
}

fn default_repetition_similarity() -> f64 {
    0.8
}

fn default_max_turns() -> usize {
    15
}

fn default_max_email_retries() -> u32 {
    3
}

fn default_model() -> String {
    "gpt-4.1-nano".to_string()
}

/// Run settings, read from YAML. Every field has a default so a partial
/// file (or none at all) is fine. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    #[serde(default = "default_judge_timeout_ms")]
    pub judge_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_timeout_ms: Option<u64>,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "JudgeCriterion::defaults")]
    pub criteria: Vec<JudgeCriterion>,
    #[serde(default = "default_max_verification_attempts")]
    pub max_verification_attempts: usize,
    #[serde(default = "default_repetition_similarity")]
    pub repetition_similarity: f64,
    #[serde(default = "default_max_turns")]
    pub default_max_turns: usize,
    /// Turn-note mismatches fail the trajectory instead of being noted.
    #[serde(default)]
    pub strict_turn_notes: bool,
    #[serde(default = "default_model")]
    pub agent_model: String,
    #[serde(default = "default_model")]
    pub judge_model: String,
    #[serde(default)]
    pub tool_mode: ToolMode,
    #[serde(default = "default_max_email_retries")]
    pub max_email_retries: u32,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            agent_timeout_ms: default_agent_timeout_ms(),
            judge_timeout_ms: default_judge_timeout_ms(),
            scenario_timeout_ms: None,
            pass_threshold: default_pass_threshold(),
            criteria: JudgeCriterion::defaults(),
            max_verification_attempts: default_max_verification_attempts(),
            repetition_similarity: default_repetition_similarity(),
            default_max_turns: default_max_turns(),
            strict_turn_notes: false,
            agent_model: default_model(),
            judge_model: default_model(),
            tool_mode: ToolMode::default(),
            max_email_retries: default_max_email_retries(),
        }
    }
}

impl EvalConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self, EvalError> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<JudgeCriterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_scenario_timeout(mut self, timeout: Duration) -> Self {
        self.scenario_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn with_strict_turn_notes(mut self, strict: bool) -> Self {
        self.strict_turn_notes = strict;
        self
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }

    pub fn scenario_timeout(&self) -> Option<Duration> {
        self.scenario_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.concurrency == 0 {
            return Err(EvalError::Config("concurrency must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err(EvalError::Config(format!(
                "pass_threshold {} is outside [0, 1]",
                self.pass_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.repetition_similarity) {
            return Err(EvalError::Config(format!(
                "repetition_similarity {} is outside [0, 1]",
                self.repetition_similarity
            )));
        }
        let mut names = BTreeSet::new();
        for criterion in &self.criteria {
            if criterion.weight < 0.0 || !criterion.weight.is_finite() {
                return Err(EvalError::Config(format!(
                    "criterion '{}' has invalid weight {}",
                    criterion.name, criterion.weight
                )));
            }
            if !names.insert(criterion.name.as_str()) {
                return Err(EvalError::Config(format!(
                    "criterion '{}' is listed twice",
                    criterion.name
                )));
            }
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
