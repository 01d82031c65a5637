//! Wire format shared by the OpenAI-compatible chat completion endpoints.

use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LLMError,
    functions::{Tool, ToolChoice},
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
};

#[derive(Debug, Serialize)]
struct RequestBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

impl From<CompletionRequest> for RequestBody {
    fn from(request: CompletionRequest) -> Self {
        Self {
            model: request.model,
            messages: request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.response_format,
            tools: request.tools,
            tool_choice: request.tool_choice,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Posts `request` through `builder` (already carrying auth headers) and
/// returns the first choice.
pub(crate) async fn send(
    builder: RequestBuilder,
    request: CompletionRequest,
) -> Result<CompletionResponse, LLMError> {
    let response = builder.json(&RequestBody::from(request)).send().await?;
    let status = response.status();

    if !status.is_success() {
        let text = response.text().await?;
        let detail = serde_json::from_str::<ErrorEnvelope>(&text)
            .ok()
            .and_then(|envelope| envelope.error)
            .map(|error| error.message);
        return Err(LLMError::Provider(match detail {
            Some(message) => format!("{status}: {message}"),
            None => format!("unexpected status {status}: {text}"),
        }));
    }

    let parsed: ResponseBody = response.json().await?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

    Ok(CompletionResponse {
        message: choice.message,
        usage: parsed.usage,
    })
}
