use async_trait::async_trait;
use rasp_core::{Passage, RaspError, RaspResult, RetrievalResult, VectorStoreConfig};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::retry::call_with_retry;

/// Queries a remote ANN index for top-K matches with metadata (spec §4.2, C2).
///
/// `top_k` returns results score-descending, ties broken by `passage_id`
/// ascending. Empty results are a valid, non-error outcome.
#[async_trait]
pub trait VectorStoreClient: Send + Sync {
    async fn top_k(
        &self,
        vector: &[f32],
        k: usize,
        cancel: &CancellationToken,
    ) -> RaspResult<Vec<RetrievalResult>>;

    /// Used only by health checks, never on the hot path.
    async fn ping(&self) -> RaspResult<()>;
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct QueryResponse {
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    passage_id: String,
    text: String,
    source_label: String,
    score: f32,
}

/// HTTP-backed [`VectorStoreClient`].
pub struct HttpVectorStoreClient {
    client: reqwest::Client,
    config: VectorStoreConfig,
    max_retries: u32,
    base_delay: std::time::Duration,
}

impl HttpVectorStoreClient {
    pub fn new(config: VectorStoreConfig, max_retries: u32, base_delay: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            max_retries,
            base_delay,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.host.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn top_k_once(&self, vector: &[f32], k: usize) -> RaspResult<Vec<RetrievalResult>> {
        let response = self
            .client
            .post(self.endpoint("query"))
            .json(&QueryRequest {
                vector,
                top_k: k,
                namespace: self.config.namespace.as_deref(),
            })
            .send()
            .await
            .map_err(|e| RaspError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RaspError::RateLimit {
                retry_after_secs: None,
            });
        }
        if status.is_server_error() {
            return Err(RaspError::ProviderNon2xx(format!("vector store returned {status}")));
        }
        if !status.is_success() {
            return Err(RaspError::ModelUnavailable(format!("vector store rejected query ({status})")));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| RaspError::ProviderNon2xx(format!("invalid vector store response: {e}")))?;

        let mut results: Vec<RetrievalResult> = parsed
            .matches
            .into_iter()
            .map(|m| RetrievalResult {
                passage: Passage {
                    passage_id: m.passage_id,
                    text: m.text,
                    source_label: m.source_label,
                },
                score: m.score,
            })
            .collect();

        // Deterministic ordering: score descending, passage_id ascending on ties.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.passage.passage_id.cmp(&b.passage.passage_id))
        });
        results.truncate(k);
        Ok(results)
    }
}

#[async_trait]
impl VectorStoreClient for HttpVectorStoreClient {
    async fn top_k(
        &self,
        vector: &[f32],
        k: usize,
        cancel: &CancellationToken,
    ) -> RaspResult<Vec<RetrievalResult>> {
        if vector.is_empty() {
            return Err(RaspError::Config("query vector must not be empty".into()));
        }
        if vector.len() != self.config.dim {
            return Err(RaspError::Config(format!(
                "query vector dimension mismatch: expected {}, got {}",
                self.config.dim,
                vector.len()
            )));
        }
        call_with_retry(self.max_retries, self.base_delay, cancel, || self.top_k_once(vector, k)).await
    }

    async fn ping(&self) -> RaspResult<()> {
        let response = self
            .client
            .get(self.endpoint("health"))
            .send()
            .await
            .map_err(|e| RaspError::Network(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RaspError::ProviderNon2xx(format!(
                "vector store health check returned {}",
                response.status()
            )))
        }
    }
}

/// In-memory [`VectorStoreClient`] returning canned results, for tests.
pub struct FakeVectorStoreClient {
    pub hits: Vec<RetrievalResult>,
}

#[async_trait]
impl VectorStoreClient for FakeVectorStoreClient {
    async fn top_k(
        &self,
        _vector: &[f32],
        k: usize,
        _cancel: &CancellationToken,
    ) -> RaspResult<Vec<RetrievalResult>> {
        Ok(self.hits.iter().take(k).cloned().collect())
    }

    async fn ping(&self) -> RaspResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str) -> Passage {
        Passage {
            passage_id: id.into(),
            text: format!("text for {id}"),
            source_label: format!("Source {id}"),
        }
    }

    #[tokio::test]
    async fn fake_client_truncates_to_k() {
        let client = FakeVectorStoreClient {
            hits: vec![
                RetrievalResult { passage: passage("a"), score: 0.9 },
                RetrievalResult { passage: passage("b"), score: 0.8 },
                RetrievalResult { passage: passage("c"), score: 0.7 },
            ],
        };
        let cancel = CancellationToken::new();
        let results = client.top_k(&[0.1, 0.2], 2, &cancel).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn fake_client_allows_empty_hits() {
        let client = FakeVectorStoreClient { hits: vec![] };
        let cancel = CancellationToken::new();
        let results = client.top_k(&[0.1], 5, &cancel).await.unwrap();
        assert!(results.is_empty());
    }
}
