use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use rasp_core::{CompletionConfig, RaspError, RaspResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::retry::create_stream_with_retry;

/// A boxed, owned stream of content deltas.
pub type DeltaStream = Pin<Box<dyn Stream<Item = RaspResult<String>> + Send>>;

/// Streams chat-completion deltas from a remote LLM (spec §4.3, C3).
///
/// Deltas are yielded in order, verbatim, with no reordering; the stream
/// ends with `None` on clean end-of-stream. Consumption must happen inline
/// with the caller's own read loop (no internal buffering worker) so that
/// dropping the stream — as the orchestrator does on cancellation or a
/// failed sink write — stops byte consumption immediately. Once any delta
/// has been yielded, no further retry is attempted; a transport failure
/// before the first delta may be retried once by the adapter.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream(&self, prompt: &str, cancel: &CancellationToken) -> RaspResult<DeltaStream>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    stream: bool,
    temperature: f32,
    top_p: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

/// HTTP-backed [`CompletionClient`] speaking an OpenAI-compatible
/// `chat/completions` SSE stream.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    config: CompletionConfig,
}

impl HttpCompletionClient {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    async fn connect(&self, prompt: &str) -> RaspResult<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&ChatCompletionRequest {
                model: &self.config.model,
                stream: true,
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                messages: [ChatMessage { role: "user", content: prompt }],
            })
            .send()
            .await
            .map_err(|e| RaspError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RaspError::RateLimit { retry_after_secs: None });
        }
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(RaspError::ModelUnavailable(format!("completion provider returned {status}")));
        }
        if status.is_server_error() {
            return Err(RaspError::ProviderNon2xx(format!("completion provider returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RaspError::ModelUnavailable(format!(
                "completion provider rejected request ({status}): {body}"
            )));
        }
        Ok(response)
    }
}

/// Parses one SSE `data: ` line into a content delta. Returns `None` for the
/// terminal `[DONE]` sentinel, blank lines, or chunks carrying no content.
fn parse_sse_line(line: &str) -> Option<Option<String>> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(None);
    }
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty());
    Some(delta)
}

/// One step of the SSE line-decoder state machine: pulls bytes until a full
/// line is available, parses it, and yields at most one item per call. The
/// `errored` flag stops iteration after the single error item it produced.
async fn advance_sse<S>(mut state: (S, String, bool)) -> Option<(RaspResult<String>, (S, String, bool))>
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    let (mut bytes, mut pending, errored) = state;
    if errored {
        return None;
    }
    loop {
        if let Some(newline) = pending.find('\n') {
            let line = pending[..newline].trim_end_matches('\r').to_string();
            pending.drain(..=newline);
            match parse_sse_line(&line) {
                Some(Some(delta)) => return Some((Ok(delta), (bytes, pending, false))),
                Some(None) => return None,
                None => continue,
            }
        }
        match bytes.next().await {
            Some(Ok(chunk)) => pending.push_str(&String::from_utf8_lossy(&chunk)),
            Some(Err(e)) => return Some((Err(RaspError::Network(e.to_string())), (bytes, pending, true))),
            None => return None,
        }
    }
}

fn decode_sse_deltas(response: reqwest::Response) -> DeltaStream {
    let state = (response.bytes_stream(), String::new(), false);
    Box::pin(futures_util::stream::unfold(state, advance_sse))
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn stream(&self, prompt: &str, cancel: &CancellationToken) -> RaspResult<DeltaStream> {
        let response = create_stream_with_retry(cancel, || self.connect(prompt)).await?;
        Ok(decode_sse_deltas(response))
    }
}

/// In-memory [`CompletionClient`] replaying a canned delta sequence, for tests.
pub struct FakeCompletionClient {
    pub deltas: Vec<String>,
}

#[async_trait]
impl CompletionClient for FakeCompletionClient {
    async fn stream(&self, _prompt: &str, _cancel: &CancellationToken) -> RaspResult<DeltaStream> {
        let items: Vec<RaspResult<String>> = self.deltas.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}
