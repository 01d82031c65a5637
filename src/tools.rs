//! The five onboarding tools, in real and mock flavours, plus schema-based
//! argument validation used by the trajectory grader.

use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    functions::{FunctionDefinition, FunctionParameters, FunctionRegistry, KernelFunction},
    state::Plan,
    LLMError,
};

pub const VALIDATE_EMAIL: &str = "validate_email";
pub const SEND_VERIFICATION_CODE: &str = "send_verification_code";
pub const CHECK_VERIFICATION_CODE: &str = "check_verification_code";
pub const CREATE_ACCOUNT: &str = "create_account";
pub const GET_PLAN_DETAILS: &str = "get_plan_details";

/// Code accepted by the mock verification tools.
pub const MOCK_VERIFICATION_CODE: &str = "123456";

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern is valid")
});

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

/// Pricing, features and limits for a plan.
pub fn plan_details(plan: Plan) -> Value {
    match plan {
        Plan::Free => json!({
            "plan": "free",
            "price": "$0/month",
            "features": ["Basic support", "5 projects", "1 GB storage"],
            "limits": {"projects": 5, "storage_gb": 1, "team_members": 1}
        }),
        Plan::Pro => json!({
            "plan": "pro",
            "price": "$29/month",
            "features": ["Priority support", "50 projects", "100 GB storage", "Team collaboration"],
            "limits": {"projects": 50, "storage_gb": 100, "team_members": 10}
        }),
        Plan::Enterprise => json!({
            "plan": "enterprise",
            "price": "$99/month",
            "features": ["Dedicated support", "Unlimited projects", "1 TB storage", "SSO", "Audit logs"],
            "limits": {"projects": -1, "storage_gb": 1000, "team_members": -1}
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    Real,
    /// Deterministic behaviour for evaluations: every email is valid and the
    /// verification code is always [`MOCK_VERIFICATION_CODE`].
    #[default]
    Mock,
}

impl FromStr for ToolMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "real" => Ok(ToolMode::Real),
            "mock" => Ok(ToolMode::Mock),
            other => Err(format!("unknown tool mode '{other}', expected real or mock")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    ValidateEmail,
    SendVerificationCode,
    CheckVerificationCode,
    CreateAccount,
    GetPlanDetails,
}

#[derive(Deserialize, JsonSchema)]
struct EmailArgs {
    /// Email address supplied by the user.
    email: String,
}

#[derive(Deserialize, JsonSchema)]
struct CheckCodeArgs {
    email: String,
    /// Six digit code the user typed.
    code: String,
}

#[derive(Deserialize, JsonSchema)]
struct CreateAccountArgs {
    name: String,
    email: String,
    plan: Plan,
    #[serde(default)]
    preferences: BTreeMap<String, Value>,
}

#[derive(Deserialize, JsonSchema)]
struct PlanArgs {
    #[schemars(with = "Plan")]
    plan: String,
}

type CodeBook = Arc<Mutex<HashMap<String, String>>>;

struct OnboardingTool {
    kind: ToolKind,
    mode: ToolMode,
    codes: CodeBook,
}

fn parse_args<T: DeserializeOwned>(arguments: &Value) -> Result<T, LLMError> {
    serde_json::from_value(arguments.clone())
        .map_err(|error| LLMError::InvalidFunctionArguments(error.to_string()))
}

impl OnboardingTool {
    fn name(&self) -> &'static str {
        match self.kind {
            ToolKind::ValidateEmail => VALIDATE_EMAIL,
            ToolKind::SendVerificationCode => SEND_VERIFICATION_CODE,
            ToolKind::CheckVerificationCode => CHECK_VERIFICATION_CODE,
            ToolKind::CreateAccount => CREATE_ACCOUNT,
            ToolKind::GetPlanDetails => GET_PLAN_DETAILS,
        }
    }

    fn send_code(&self, email: String) -> String {
        let code = match self.mode {
            ToolMode::Mock => MOCK_VERIFICATION_CODE.to_string(),
            ToolMode::Real => format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32)),
        };
        self.codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(email, code.clone());
        code
    }

    fn check_code(&self, email: &str, code: &str) -> bool {
        match self.mode {
            ToolMode::Mock => code.trim() == MOCK_VERIFICATION_CODE,
            ToolMode::Real => self
                .codes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(email)
                .is_some_and(|sent| sent == code.trim()),
        }
    }
}

#[async_trait]
impl KernelFunction for OnboardingTool {
    fn definition(&self) -> FunctionDefinition {
        let (description, parameters) = match self.kind {
            ToolKind::ValidateEmail => (
                "Validate whether an email address has correct format.",
                FunctionParameters::for_type::<EmailArgs>(),
            ),
            ToolKind::SendVerificationCode => (
                "Send a 6-digit verification code to the given email address. Returns the code string.",
                FunctionParameters::for_type::<EmailArgs>(),
            ),
            ToolKind::CheckVerificationCode => (
                "Check whether the verification code matches the one sent to the email.",
                FunctionParameters::for_type::<CheckCodeArgs>(),
            ),
            ToolKind::CreateAccount => (
                "Create a new user account with the given name, email, plan, and preferences.",
                FunctionParameters::for_type::<CreateAccountArgs>(),
            ),
            ToolKind::GetPlanDetails => (
                "Get pricing, features, and limits for a plan (free, pro, or enterprise).",
                FunctionParameters::for_type::<PlanArgs>(),
            ),
        };

        FunctionDefinition::new(self.name())
            .with_description(description)
            .with_parameters(parameters)
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        match self.kind {
            ToolKind::ValidateEmail => {
                let args: EmailArgs = parse_args(arguments)?;
                let valid = match self.mode {
                    ToolMode::Mock => true,
                    ToolMode::Real => is_valid_email(args.email.trim()),
                };
                Ok(Value::Bool(valid))
            }
            ToolKind::SendVerificationCode => {
                let args: EmailArgs = parse_args(arguments)?;
                Ok(Value::String(self.send_code(args.email)))
            }
            ToolKind::CheckVerificationCode => {
                let args: CheckCodeArgs = parse_args(arguments)?;
                Ok(Value::Bool(self.check_code(&args.email, &args.code)))
            }
            ToolKind::CreateAccount => {
                let args: CreateAccountArgs = parse_args(arguments)?;
                let account = match self.mode {
                    ToolMode::Mock => json!({"account_id": "mock-account", "status": "created"}),
                    ToolMode::Real => json!({
                        "account_id": uuid::Uuid::new_v4().to_string(),
                        "status": "created",
                        "name": args.name,
                        "email": args.email,
                        "plan": args.plan,
                        "preferences": args.preferences,
                    }),
                };
                Ok(account)
            }
            ToolKind::GetPlanDetails => {
                let args: PlanArgs = parse_args(arguments)?;
                // Exact match, the same as the schema enum the arguments are graded against.
                match Plan::ALL.into_iter().find(|plan| plan.as_str() == args.plan) {
                    Some(plan) => Ok(plan_details(plan)),
                    None => Ok(json!({
                        "error": format!("Unknown plan: {}. Valid plans: free, pro, enterprise", args.plan)
                    })),
                }
            }
        }
    }
}

/// Registry holding all five tools. Send/check share one code book.
pub fn onboarding_registry(mode: ToolMode) -> FunctionRegistry {
    let codes: CodeBook = Arc::new(Mutex::new(HashMap::new()));
    let mut registry = FunctionRegistry::new();
    for kind in [
        ToolKind::ValidateEmail,
        ToolKind::SendVerificationCode,
        ToolKind::CheckVerificationCode,
        ToolKind::CreateAccount,
        ToolKind::GetPlanDetails,
    ] {
        registry.register(Arc::new(OnboardingTool {
            kind,
            mode,
            codes: Arc::clone(&codes),
        }));
    }
    registry
}

/// Compiled argument schemas keyed by tool name.
pub struct ToolArgumentValidator {
    validators: BTreeMap<String, JSONSchema>,
}

impl ToolArgumentValidator {
    pub fn from_registry(registry: &FunctionRegistry) -> Result<Self, LLMError> {
        let mut validators = BTreeMap::new();
        for definition in registry.definitions() {
            let schema = definition.parameters_schema();
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&schema)
                .map_err(|e| LLMError::InvalidFunctionArguments(e.to_string()))?;
            validators.insert(definition.name, compiled);
        }
        Ok(Self { validators })
    }

    pub fn knows(&self, tool: &str) -> bool {
        self.validators.contains_key(tool)
    }

    /// Schema errors for the call; an unknown tool is an error too.
    pub fn validate(&self, tool: &str, arguments: &Value) -> Result<(), Vec<String>> {
        let Some(schema) = self.validators.get(tool) else {
            return Err(vec![format!("unknown tool: {tool}")]);
        };
        match schema.validate(arguments) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors.map(|e| e.to_string()).collect()),
        }
    }
}
