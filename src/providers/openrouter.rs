use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::{
    error::LLMError,
    providers::{chat_api, LLMProvider},
    types::{CompletionRequest, CompletionResponse},
};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
    /// Sent as `X-Title` so runs are attributable on the OpenRouter dashboard.
    pub title: String,
}

impl OpenRouterConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(60),
            title: "onboarding-eval".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouter {
    client: Client,
    config: OpenRouterConfig,
}

impl OpenRouter {
    pub fn from_env() -> Result<Self, LLMError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| LLMError::MissingApiKey("OPENROUTER_API_KEY"))?;
        Self::from_config(OpenRouterConfig::new(api_key))
    }

    pub fn from_config(config: OpenRouterConfig) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LLMProvider for OpenRouter {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let builder = self
            .client
            .post(chat_api::endpoint(&self.config.base_url, "chat/completions"))
            .bearer_auth(&self.config.api_key)
            .header("X-Title", &self.config.title);
        chat_api::send(builder, request).await
    }

    fn name(&self) -> &'static str {
        "openrouter"
    }
}
