use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use tollgate_core::domain::knowledge::EmbeddingModel;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Transport(String),
    #[error("embedding service returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("embedding response could not be decoded: {0}")]
    Decode(String),
}

/// Turns text into a vector in one fixed model's space.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &EmbeddingModel;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// OpenAI-compatible `/v1/embeddings` client.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: EmbeddingModel,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: EmbeddingModel,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| EmbeddingError::Transport(error.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url, api_key, model })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &EmbeddingModel {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({ "model": self.model.name, "input": text }))
            .send()
            .await
            .map_err(|error| EmbeddingError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api { status: status.as_u16(), message });
        }

        let parsed: EmbeddingResponse =
            response.json().await.map_err(|error| EmbeddingError::Decode(error.to_string()))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| EmbeddingError::Decode("response carried no embedding".to_string()))?;

        debug!(
            event_name = "knowledge.embedding.created",
            model = %self.model.name,
            dimensions = vector.len(),
            "text embedded"
        );
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use tollgate_core::domain::knowledge::EmbeddingModel;

    use super::{Embedder, EmbeddingError, OpenAiEmbedder};

    fn embedder(server: &MockServer) -> OpenAiEmbedder {
        OpenAiEmbedder::new(
            server.uri(),
            SecretString::from("sk-embed".to_string()),
            EmbeddingModel::new("text-embedding-3-small", "1"),
            Duration::from_secs(5),
        )
        .expect("embedder")
    }

    #[tokio::test]
    async fn returns_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3], "index": 0 }],
                "model": "text-embedding-3-small"
            })))
            .mount(&server)
            .await;

        let vector = embedder(&server).embed("refund policy").await.expect("embed");
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn empty_payload_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let error = embedder(&server).embed("anything").await.expect_err("no vector");
        assert!(matches!(error, EmbeddingError::Decode(_)));
    }
}
