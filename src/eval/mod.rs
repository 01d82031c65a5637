pub mod driver;
pub mod generate;
pub mod judge;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod step;
pub mod trajectory;
pub mod verdict;

use crate::{config::EvalConfig, functions::FunctionRegistry, tools::ToolArgumentValidator, LLMError};

/// Everything the graders read besides the transcript: thresholds, judge
/// criteria and the tool schemas calls are validated against.
pub struct GradingContext {
    pub config: EvalConfig,
    pub validator: ToolArgumentValidator,
}

impl GradingContext {
    pub fn new(config: EvalConfig, registry: &FunctionRegistry) -> Result<Self, LLMError> {
        Ok(Self {
            config,
            validator: ToolArgumentValidator::from_registry(registry)?,
        })
    }
}

/// Body of the first fenced code block, preferring one tagged `json`.
pub(crate) fn extract_json_block(content: &str) -> Option<&str> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::extract_json_block;

    #[test]
    fn finds_fenced_json() {
        let text = "Scenario:\n```json\n{\"eval_mode\": \"step\"}\n```\ntrailing";
        assert_eq!(extract_json_block(text), Some("{\"eval_mode\": \"step\"}"));
        assert_eq!(extract_json_block("{\"a\": 1}"), None);
    }
}
