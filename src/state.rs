//! Onboarding progress: the stage machine's ordering and the record of what
//! has been collected so far.

use std::{collections::BTreeMap, fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Greeting,
    CollectName,
    CollectEmail,
    VerifyEmail,
    SelectPlan,
    CollectPreferences,
    Confirm,
    Complete,
    /// Abandoned after too many invalid email attempts. Terminal, off the
    /// ordered path.
    Error,
}

static STAGE_MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:stage\s*:\s*)?(greeting|collect_name|collect_email|verify_email|select_plan|collect_preferences|confirm|complete|error)\s*(?:$|[,;:(-])",
    )
    .expect("stage pattern is valid")
});

impl Stage {
    /// The ordered onboarding path, `greeting` through `complete`.
    pub const FLOW: [Stage; 8] = [
        Stage::Greeting,
        Stage::CollectName,
        Stage::CollectEmail,
        Stage::VerifyEmail,
        Stage::SelectPlan,
        Stage::CollectPreferences,
        Stage::Confirm,
        Stage::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::CollectName => "collect_name",
            Stage::CollectEmail => "collect_email",
            Stage::VerifyEmail => "verify_email",
            Stage::SelectPlan => "select_plan",
            Stage::CollectPreferences => "collect_preferences",
            Stage::Confirm => "confirm",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    /// Position on the ordered path; `None` for `error`.
    pub fn index(self) -> Option<usize> {
        Self::FLOW.iter().position(|stage| *stage == self)
    }

    pub fn next(self) -> Option<Stage> {
        self.index().and_then(|index| Self::FLOW.get(index + 1).copied())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    /// Number of agent turns needed to reach this stage from a fresh
    /// conversation when every answer is accepted first time.
    pub fn minimum_turns_to_reach(self) -> Option<usize> {
        self.index()
    }

    /// Whether one agent turn may move the conversation from `self` to `to`:
    /// stay put, advance exactly one stage, branch back from `confirm` to
    /// `select_plan`, or abort `collect_email` into `error`.
    pub fn can_transition_to(self, to: Stage) -> bool {
        if self == to {
            return true;
        }
        if self.next() == Some(to) {
            return true;
        }
        matches!(
            (self, to),
            (Stage::Confirm, Stage::SelectPlan) | (Stage::CollectEmail, Stage::Error)
        )
    }

    /// Stage a turn note names. The note must lead with the stage, optionally
    /// as `stage: <name>`, followed by the end or a `,;:(-` separator.
    pub fn from_note(note: &str) -> Option<Stage> {
        STAGE_MENTION
            .captures(note)
            .and_then(|captures| captures.get(1))
            .and_then(|found| found.as_str().to_ascii_lowercase().parse().ok())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let stage = match value.trim() {
            "greeting" => Stage::Greeting,
            "collect_name" => Stage::CollectName,
            "collect_email" => Stage::CollectEmail,
            "verify_email" => Stage::VerifyEmail,
            "select_plan" => Stage::SelectPlan,
            "collect_preferences" => Stage::CollectPreferences,
            "confirm" => Stage::Confirm,
            "complete" => Stage::Complete,
            "error" => Stage::Error,
            other => return Err(UnknownStage(other.to_string())),
        };
        Ok(stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Free, Plan::Pro, Plan::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(StateError::UnknownPlan(other.to_string())),
        }
    }
}

/// A broken ordering rule found on a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvariantViolation {
    #[error("email marked verified but no email was collected")]
    VerifiedWithoutEmail,
    #[error("plan selected before the email was verified")]
    PlanBeforeVerification,
    #[error("account created while {missing:?} still missing")]
    AccountCreatedPrematurely { missing: Vec<&'static str> },
    #[error("stage is complete but no account was created")]
    CompleteWithoutAccount,
    #[error("account created but stage is {stage}")]
    AccountOutsideComplete { stage: Stage },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("cannot verify email before one is collected")]
    NoEmail,
    #[error("cannot select a plan before the email is verified")]
    EmailNotVerified,
    #[error("cannot create the account, missing: {0:?}")]
    MissingFields(Vec<&'static str>),
    #[error("unknown plan: {0}")]
    UnknownPlan(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OnboardingState {
    #[serde(default, alias = "current_stage")]
    pub stage: Stage,
    #[serde(default, alias = "user_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
    #[serde(default)]
    pub account_created: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OnboardingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Records a new address. Changing the address drops any earlier
    /// verification.
    pub fn set_email(&mut self, email: impl Into<String>) {
        let email = email.into();
        if self.email.as_deref() != Some(email.as_str()) {
            self.email_verified = false;
        }
        self.email = Some(email);
    }

    pub fn mark_email_verified(&mut self) -> Result<(), StateError> {
        if self.email.is_none() {
            return Err(StateError::NoEmail);
        }
        self.email_verified = true;
        Ok(())
    }

    pub fn select_plan(&mut self, plan: Plan) -> Result<(), StateError> {
        if !self.email_verified {
            return Err(StateError::EmailNotVerified);
        }
        self.plan = Some(plan);
        Ok(())
    }

    pub fn set_preferences(&mut self, preferences: BTreeMap<String, Value>) {
        self.preferences = preferences;
    }

    /// Fields that must be populated before the account can be created.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.as_deref().map_or(true, |name| name.trim().is_empty()) {
            missing.push("name");
        }
        if self.email.is_none() {
            missing.push("email");
        }
        if !self.email_verified {
            missing.push("email_verified");
        }
        if self.plan.is_none() {
            missing.push("plan");
        }
        missing
    }

    /// Marks the account created and moves to `complete`.
    pub fn mark_account_created(&mut self) -> Result<(), StateError> {
        let missing = self.missing_required_fields();
        if !missing.is_empty() {
            return Err(StateError::MissingFields(missing));
        }
        self.account_created = true;
        self.stage = Stage::Complete;
        Ok(())
    }

    pub fn invariant_violations(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        if self.email_verified && self.email.is_none() {
            violations.push(InvariantViolation::VerifiedWithoutEmail);
        }
        if self.plan.is_some() && !self.email_verified {
            violations.push(InvariantViolation::PlanBeforeVerification);
        }
        if self.account_created {
            let missing = self.missing_required_fields();
            if !missing.is_empty() {
                violations.push(InvariantViolation::AccountCreatedPrematurely { missing });
            }
            if self.stage != Stage::Complete {
                violations.push(InvariantViolation::AccountOutsideComplete { stage: self.stage });
            }
        } else if self.stage == Stage::Complete {
            violations.push(InvariantViolation::CompleteWithoutAccount);
        }
        violations
    }

    /// Field lookup by the names scenario files use.
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "stage" | "current_stage" => Value::String(self.stage.as_str().to_string()),
            "name" | "user_name" => self.name.clone().map(Value::String).unwrap_or(Value::Null),
            "email" => self.email.clone().map(Value::String).unwrap_or(Value::Null),
            "email_verified" => Value::Bool(self.email_verified),
            "plan" => self
                .plan
                .map(|plan| Value::String(plan.as_str().to_string()))
                .unwrap_or(Value::Null),
            "preferences" => Value::Object(
                self.preferences
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
            "account_created" => Value::Bool(self.account_created),
            "retry_count" => Value::from(self.retry_count),
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verified_state() -> OnboardingState {
        let mut state = OnboardingState::new();
        state.set_name("Priya Sharma");
        state.set_email("priya@example.com");
        state.mark_email_verified().expect("verify");
        state
    }

    #[test]
    fn ordered_transitions() {
        assert!(Stage::Greeting.can_transition_to(Stage::CollectName));
        assert!(Stage::SelectPlan.can_transition_to(Stage::SelectPlan));
        assert!(Stage::Confirm.can_transition_to(Stage::SelectPlan));
        assert!(Stage::CollectEmail.can_transition_to(Stage::Error));
        assert!(!Stage::CollectName.can_transition_to(Stage::VerifyEmail));
        assert!(!Stage::SelectPlan.can_transition_to(Stage::CollectEmail));
        assert!(!Stage::Complete.can_transition_to(Stage::Greeting));
        assert_eq!(Stage::Complete.next(), None);
        assert_eq!(Stage::Error.index(), None);
        assert_eq!(Stage::Complete.minimum_turns_to_reach(), Some(7));
    }

    #[test]
    fn stage_from_note_reads_the_leading_stage() {
        assert_eq!(Stage::from_note("verify_email"), Some(Stage::VerifyEmail));
        assert_eq!(Stage::from_note("confirm, unclear reply"), Some(Stage::Confirm));
        assert_eq!(
            Stage::from_note("Stage: SELECT_PLAN (user asks about plans)"),
            Some(Stage::SelectPlan)
        );
        assert_eq!(Stage::from_note("user says hello"), None);
    }

    #[test]
    fn stage_words_inside_prose_are_not_stages() {
        assert_eq!(Stage::from_note("user makes a typo error"), None);
        assert_eq!(Stage::from_note("asks to confirm the price"), None);
        assert_eq!(Stage::from_note("error recovery after typo"), None);
    }

    #[test]
    fn verification_requires_email() {
        let mut state = OnboardingState::new();
        assert_eq!(state.mark_email_verified(), Err(StateError::NoEmail));
        assert_eq!(state.select_plan(Plan::Pro), Err(StateError::EmailNotVerified));

        state.set_email("a@b.io");
        state.mark_email_verified().expect("verify");
        state.select_plan(Plan::Pro).expect("plan");
        assert_eq!(state.plan, Some(Plan::Pro));
    }

    #[test]
    fn changing_email_drops_verification() {
        let mut state = verified_state();
        state.set_email("priya@example.com");
        assert!(state.email_verified);
        state.set_email("other@example.com");
        assert!(!state.email_verified);
    }

    #[test]
    fn account_creation_requires_all_fields() {
        let mut state = verified_state();
        assert_eq!(
            state.mark_account_created(),
            Err(StateError::MissingFields(vec!["plan"]))
        );
        state.select_plan(Plan::Free).expect("plan");
        state.mark_account_created().expect("create");
        assert!(state.account_created);
        assert_eq!(state.stage, Stage::Complete);
        assert!(state.invariant_violations().is_empty());
    }

    #[test]
    fn reports_violations_of_injected_state() {
        let state: OnboardingState = serde_json::from_value(json!({
            "current_stage": "confirm",
            "user_name": "Priya",
            "email_verified": true,
            "plan": "pro",
            "account_created": true
        }))
        .expect("state");

        let violations = state.invariant_violations();
        assert!(violations.contains(&InvariantViolation::VerifiedWithoutEmail));
        assert!(violations.contains(&InvariantViolation::AccountOutsideComplete {
            stage: Stage::Confirm
        }));
        assert!(violations
            .iter()
            .any(|v| matches!(v, InvariantViolation::AccountCreatedPrematurely { missing } if missing == &vec!["email"])));
    }

    #[test]
    fn field_lookup_uses_scenario_names() {
        let mut state = verified_state();
        state.select_plan(Plan::Enterprise).expect("plan");
        assert_eq!(state.field("user_name"), Some(json!("Priya Sharma")));
        assert_eq!(state.field("plan"), Some(json!("enterprise")));
        assert_eq!(state.field("stage"), Some(json!("greeting")));
        assert_eq!(state.field("unknown"), None);
    }
}
