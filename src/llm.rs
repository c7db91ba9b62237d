//! Text-generation collaborators used for clinical summaries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::error::GenerationError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

/// Always unavailable. Forces the deterministic summary path.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableGenerator;

#[async_trait]
impl TextGenerator for UnavailableGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable(
            "no text generation backend configured".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [RequestMessage<'a>; 1],
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn new(
        api_key: String,
        model: String,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_tokens: 600,
        })
    }

    /// Builds a client when an API key is configured, `None` otherwise.
    pub fn from_config(config: &GeneratorConfig) -> Option<Result<Self, GenerationError>> {
        let api_key = config.api_key.clone()?;
        Some(Self::new(
            api_key,
            config.model.clone(),
            &config.base_url,
            config.timeout,
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: [RequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GenerationError::Empty)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Picks the configured backend, falling back to [`UnavailableGenerator`].
pub fn generator_from_config(config: &GeneratorConfig) -> Arc<dyn TextGenerator> {
    match AnthropicClient::from_config(config) {
        Some(Ok(client)) => {
            tracing::info!(model = %client.model(), "Text generation via Anthropic enabled");
            Arc::new(client)
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Failed to build Anthropic client, using fallback summaries");
            Arc::new(UnavailableGenerator)
        }
        None => {
            tracing::info!("No text generation key configured, using fallback summaries");
            Arc::new(UnavailableGenerator)
        }
    }
}
