//! Provider adapter: the only place that speaks a vendor's wire format.
//!
//! Every concrete provider turns a [`ProviderRequest`] into its own HTTP call and
//! normalizes token accounting back into a [`ProviderResponse`]. Nothing here
//! caches or bills. Names outside the closed [`ProviderKind`] set fail fast.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use tollgate_core::domain::provider::{ProviderConfig, ProviderKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderRequest {
    pub prompt: String,
    /// Overrides the provider's default model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Self::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model_used: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider `{0}` is not implemented")]
    NotImplemented(String),
    #[error("no credential configured for provider `{0}`")]
    MissingCredential(String),
    #[error("{provider} request failed: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} returned {status}: {message}")]
    Api { provider: String, status: u16, message: String },
    #[error("{provider} response could not be decoded: {message}")]
    Decode { provider: String, message: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            Self::NotImplemented(provider) | Self::MissingCredential(provider) => provider,
            Self::Transport { provider, .. }
            | Self::Api { provider, .. }
            | Self::Decode { provider, .. } => provider,
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn invoke(
        &self,
        provider: &ProviderConfig,
        credential: Option<&SecretString>,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Adapter for the HTTP providers. Transient failures (429, 5xx, transport
/// errors) are retried here with linear backoff; callers never retry.
#[derive(Clone, Debug)]
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    max_retries: u32,
    backoff: Duration,
}

impl HttpProviderAdapter {
    pub fn new(timeout: Duration, max_retries: u32) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|error| {
            ProviderError::Transport {
                provider: "http".to_string(),
                message: format!("failed to build HTTP client: {error}"),
            }
        })?;

        Ok(Self { client, max_retries, backoff: Duration::from_millis(500) })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn post_json(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, String)],
        body: &Value,
    ) -> Result<Value, ProviderError> {
        let mut attempt = 0_u32;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.backoff * attempt).await;
            }

            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            let outcome = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    debug!(
                        event_name = "provider.http.response",
                        provider,
                        status = status.as_u16(),
                        attempt,
                        "provider responded"
                    );
                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|error| {
                            ProviderError::Decode {
                                provider: provider.to_string(),
                                message: error.to_string(),
                            }
                        });
                    }
                    let message = response.text().await.unwrap_or_default();
                    let error = ProviderError::Api {
                        provider: provider.to_string(),
                        status: status.as_u16(),
                        message: api_error_message(&message),
                    };
                    (is_transient(status), error)
                }
                Err(error) => (
                    true,
                    ProviderError::Transport {
                        provider: provider.to_string(),
                        message: error.to_string(),
                    },
                ),
            };

            match outcome {
                (true, error) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "provider.http.retry",
                        provider,
                        attempt,
                        error = %error,
                        "transient provider failure, retrying"
                    );
                }
                (_, error) => return Err(error),
            }
        }
    }

    async fn invoke_openai(
        &self,
        provider: &ProviderConfig,
        credential: &SecretString,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone().unwrap_or_else(|| provider.default_model.clone());
        let mut body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let url = format!("{}/v1/chat/completions", provider.api_url.trim_end_matches('/'));
        let headers = [("Authorization", format!("Bearer {}", credential.expose_secret()))];
        let value = self.post_json(&provider.name, &url, &headers, &body).await?;
        let parsed: OpenAiCompletion = decode(&provider.name, value)?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Decode {
                provider: provider.name.clone(),
                message: "completion had no choices".to_string(),
            })?;

        Ok(ProviderResponse {
            text,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            model_used: parsed.model.unwrap_or(model),
        })
    }

    async fn invoke_anthropic(
        &self,
        provider: &ProviderConfig,
        credential: &SecretString,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone().unwrap_or_else(|| provider.default_model.clone());
        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let url = format!("{}/v1/messages", provider.api_url.trim_end_matches('/'));
        let headers = [
            ("x-api-key", credential.expose_secret().to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        let value = self.post_json(&provider.name, &url, &headers, &body).await?;
        let parsed: AnthropicMessage = decode(&provider.name, value)?;

        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ProviderResponse {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            model_used: parsed.model.unwrap_or(model),
        })
    }

    async fn invoke_ollama(
        &self,
        provider: &ProviderConfig,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone().unwrap_or_else(|| provider.default_model.clone());
        let mut options = json!({});
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            options["temperature"] = json!(temperature);
        }
        let body = json!({
            "model": model,
            "prompt": request.prompt,
            "stream": false,
            "options": options,
        });

        let url = format!("{}/api/generate", provider.api_url.trim_end_matches('/'));
        let value = self.post_json(&provider.name, &url, &[], &body).await?;
        let parsed: OllamaGeneration = decode(&provider.name, value)?;

        Ok(ProviderResponse {
            text: parsed.response,
            input_tokens: parsed.prompt_eval_count,
            output_tokens: parsed.eval_count,
            model_used: parsed.model.unwrap_or(model),
        })
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn invoke(
        &self,
        provider: &ProviderConfig,
        credential: Option<&SecretString>,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let require_credential = || {
            credential.ok_or_else(|| ProviderError::MissingCredential(provider.name.clone()))
        };

        match provider.kind() {
            ProviderKind::OpenAi => self.invoke_openai(provider, require_credential()?, request).await,
            ProviderKind::Anthropic => {
                self.invoke_anthropic(provider, require_credential()?, request).await
            }
            ProviderKind::Ollama => self.invoke_ollama(provider, request).await,
            ProviderKind::Unregistered(name) => Err(ProviderError::NotImplemented(name)),
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn decode<T: for<'de> Deserialize<'de>>(provider: &str, value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|error| ProviderError::Decode {
        provider: provider.to_string(),
        message: error.to_string(),
    })
}

/// Pulls `error.message` out of a JSON error body when there is one.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletion {
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    model: Option<String>,
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaGeneration {
    model: Option<String>,
    response: String,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}
