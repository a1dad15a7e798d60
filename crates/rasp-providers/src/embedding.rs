use async_trait::async_trait;
use rasp_core::{EmbeddingConfig, RaspError, RaspResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::retry::call_with_retry;

/// Turns text into a dense vector via a remote API (spec §4.1, C1).
///
/// Implementers must reject dimension mismatches rather than silently
/// reshaping the result, and must honour `cancel` between retry attempts.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> RaspResult<Vec<f32>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

/// HTTP-backed [`EmbeddingClient`] speaking an OpenAI-compatible embeddings API.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    config: EmbeddingConfig,
    max_retries: u32,
    base_delay: std::time::Duration,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig, max_retries: u32, base_delay: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            max_retries,
            base_delay,
        }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        format!("{}/embeddings", base.trim_end_matches('/'))
    }

    async fn embed_once(&self, text: &str) -> RaspResult<Vec<f32>> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&EmbedRequest {
                model: &self.config.model,
                input: text,
            })
            .send()
            .await
            .map_err(|e| RaspError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(RaspError::RateLimit { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(RaspError::ProviderNon2xx(format!(
                "embedding provider returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RaspError::ModelUnavailable(format!(
                "embedding provider rejected request ({status}): {body}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RaspError::ProviderNon2xx(format!("invalid embedding response: {e}")))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| RaspError::ProviderNon2xx("embedding response contained no data".into()))?
            .embedding;

        if vector.len() != self.config.dim {
            return Err(RaspError::Config(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.config.dim,
                vector.len()
            )));
        }

        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> RaspResult<Vec<f32>> {
        if text.is_empty() {
            return Err(RaspError::Validation("embedding input must not be empty".into()));
        }
        call_with_retry(self.max_retries, self.base_delay, cancel, || self.embed_once(text)).await
    }
}

/// Deterministic in-memory [`EmbeddingClient`] used by orchestrator tests.
pub struct FakeEmbeddingClient {
    pub dim: usize,
}

#[async_trait]
impl EmbeddingClient for FakeEmbeddingClient {
    async fn embed(&self, text: &str, _cancel: &CancellationToken) -> RaspResult<Vec<f32>> {
        if text.is_empty() {
            return Err(RaspError::Validation("embedding input must not be empty".into()));
        }
        let seed: u32 = text.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        Ok((0..self.dim)
            .map(|i| ((seed.wrapping_add(i as u32) % 997) as f32) / 997.0)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_client_is_deterministic() {
        let client = FakeEmbeddingClient { dim: 8 };
        let cancel = CancellationToken::new();
        let a = client.embed("sepsis", &cancel).await.unwrap();
        let b = client.embed("sepsis", &cancel).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn fake_client_rejects_empty_input() {
        let client = FakeEmbeddingClient { dim: 8 };
        let cancel = CancellationToken::new();
        let err = client.embed("", &cancel).await.unwrap_err();
        assert!(matches!(err, RaspError::Validation(_)));
    }
}
