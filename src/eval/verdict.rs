use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Graded,
    /// The agent failed mid-drive; nothing was scored.
    Errored,
    Cancelled,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Assertion,
    Agent,
    Judge,
    Scenario,
    Cancelled,
}

/// One violated expectation, named after the check that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub check: String,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, check: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            check: check.into(),
            message: message.into(),
        }
    }

    pub fn assertion(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Assertion, check, message)
    }

    pub fn agent(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Agent, check, message)
    }

    pub fn judge(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Judge, check, message)
    }

    pub fn scenario(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Scenario, check, message)
    }
}

/// Outcome of grading one scenario. Built by the graders and the runner,
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub(crate) status: VerdictStatus,
    pub(crate) passed: bool,
    pub(crate) score: f64,
    #[serde(default)]
    pub(crate) sub_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub(crate) rationale: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) failures: Vec<Failure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) notes: Vec<String>,
}

impl Verdict {
    pub(crate) fn graded(passed: bool, score: f64) -> Self {
        Self {
            status: VerdictStatus::Graded,
            passed,
            score: score.clamp(0.0, 1.0),
            sub_scores: BTreeMap::new(),
            rationale: BTreeMap::new(),
            failures: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn unscored(status: VerdictStatus, failure: Failure) -> Self {
        Self {
            status,
            passed: false,
            score: 0.0,
            sub_scores: BTreeMap::new(),
            rationale: BTreeMap::new(),
            failures: vec![failure],
            notes: Vec::new(),
        }
    }

    pub fn errored(failure: Failure) -> Self {
        Self::unscored(VerdictStatus::Errored, failure)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::unscored(VerdictStatus::Malformed, Failure::scenario("load", message))
    }

    pub fn cancelled(after: Duration) -> Self {
        Self::unscored(
            VerdictStatus::Cancelled,
            Failure::new(
                FailureKind::Cancelled,
                "scenario_timeout",
                format!("scenario exceeded {} ms", after.as_millis()),
            ),
        )
    }

    pub(crate) fn with_sub_scores(mut self, sub_scores: BTreeMap<String, f64>) -> Self {
        self.sub_scores = sub_scores;
        self
    }

    pub(crate) fn with_rationale(mut self, rationale: BTreeMap<String, String>) -> Self {
        self.rationale = rationale;
        self
    }

    pub(crate) fn with_failures(mut self, failures: Vec<Failure>) -> Self {
        self.failures = failures;
        self
    }

    pub(crate) fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn status(&self) -> VerdictStatus {
        self.status
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn sub_scores(&self) -> &BTreeMap<String, f64> {
        &self.sub_scores
    }

    pub fn rationale(&self) -> &BTreeMap<String, String> {
        &self.rationale
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn has_failure(&self, check: &str) -> bool {
        self.failures.iter().any(|failure| failure.check == check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscored_verdicts_never_pass() {
        let errored = Verdict::errored(Failure::agent("drive", "boom"));
        assert_eq!(errored.status(), VerdictStatus::Errored);
        assert!(!errored.passed());
        assert_eq!(errored.failures()[0].kind, FailureKind::Agent);

        let cancelled = Verdict::cancelled(Duration::from_millis(250));
        assert_eq!(cancelled.failures()[0].message, "scenario exceeded 250 ms");
        assert!(cancelled.has_failure("scenario_timeout"));
    }

    #[test]
    fn graded_score_is_clamped() {
        assert_eq!(Verdict::graded(true, 1.4).score(), 1.0);
        assert_eq!(Verdict::graded(false, -0.1).score(), 0.0);
    }
}
