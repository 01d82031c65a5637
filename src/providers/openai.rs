use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;

use crate::{
    error::LLMError,
    providers::{chat_api, LLMProvider},
    types::{CompletionRequest, CompletionResponse},
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub request_timeout: Duration,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Reads `OPENAI_API_KEY` plus the optional `OPENAI_BASE_URL`,
    /// `OPENAI_ORGANIZATION` and `OPENAI_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, LLMError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| LLMError::MissingApiKey("OPENAI_API_KEY"))?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        config.organization = env::var("OPENAI_ORGANIZATION").ok();
        if let Some(ms) = env::var("OPENAI_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// Chat completions against OpenAI or any endpoint speaking its protocol.
#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn from_env() -> Result<Self, LLMError> {
        Self::from_config(OpenAIConfig::from_env()?)
    }

    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let mut builder = self
            .client
            .post(chat_api::endpoint(&self.config.base_url, "chat/completions"))
            .bearer_auth(&self.config.api_key);
        if let Some(org) = &self.config.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        chat_api::send(builder, request).await
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
