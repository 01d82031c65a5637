use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// One canned completion. Either a message (optionally with tool calls) or a
/// provider failure.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    content: Result<String, String>,
    tool_calls: Vec<(String, Value)>,
    latency: Option<Duration>,
}

impl ScriptedResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Ok(content.into()),
            tool_calls: Vec::new(),
            latency: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Err(message.into()),
            tool_calls: Vec::new(),
            latency: None,
        }
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, arguments: Value) -> Self {
        self.tool_calls.push((name.into(), arguments));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// Replays responses in order and remembers every request it was sent.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = ScriptedResponse>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self) -> Option<ScriptedResponse> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let Some(scripted) = self.next_response() else {
            return Err(LLMError::Provider("no more scripted responses".to_string()));
        };

        if let Some(latency) = scripted.latency {
            tokio::time::sleep(latency).await;
        }

        let content = scripted.content.map_err(LLMError::Provider)?;
        let tool_calls = scripted
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, (name, arguments))| {
                ToolCall::new(FunctionCall::new(name, arguments)).with_id(format!("scripted_{index}"))
            })
            .collect();

        Ok(CompletionResponse {
            message: ChatMessage::assistant(content).with_tool_calls(tool_calls),
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let provider = ScriptedProvider::new(vec![
            ScriptedResponse::text("first").with_tool_call("validate_email", json!({"email": "a@b.io"})),
            ScriptedResponse::text("second"),
        ]);

        let first = provider
            .complete(CompletionRequest::new("m", vec![ChatMessage::user("hi")]))
            .await
            .expect("first");
        assert_eq!(first.message.text(), Some("first"));
        assert_eq!(first.message.tool_calls.len(), 1);
        assert_eq!(first.message.tool_calls[0].function.name, "validate_email");

        let second = provider
            .complete(CompletionRequest::new("m", vec![]))
            .await
            .expect("second");
        assert_eq!(second.message.text(), Some("second"));
        assert_eq!(provider.remaining(), 0);

        let exhausted = provider.complete(CompletionRequest::new("m", vec![])).await;
        assert!(matches!(exhausted, Err(LLMError::Provider(_))));
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn scripted_error_surfaces_as_provider_error() {
        let provider = ScriptedProvider::new(vec![ScriptedResponse::error("upstream down")]);
        let result = provider.complete(CompletionRequest::new("m", vec![])).await;
        match result {
            Err(LLMError::Provider(message)) => assert_eq!(message, "upstream down"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
