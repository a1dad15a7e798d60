use async_trait::async_trait;
use axum::response::sse::Event;
use rasp_core::{RaspError, RaspResult};
use tokio::sync::mpsc;

use rasp_orchestrator::StreamSink;

/// [`StreamSink`] backed by a bounded channel feeding an axum SSE body. A
/// full/closed channel means the client went away, which the orchestrator
/// must treat the same as an explicit cancellation (spec §4.6).
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Emits the terminal `event: error` frame for a pipeline failure that
    /// occurred after the SSE response had already started.
    pub async fn emit_error(&mut self, err: &RaspError) {
        let _ = self
            .tx
            .send(Event::default().event("error").data(serde_json::json!({ "error": err.to_string() }).to_string()))
            .await;
    }

    fn disconnected() -> RaspError {
        RaspError::Cancelled
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn send_data(&mut self, json_payload: String) -> RaspResult<()> {
        self.tx
            .send(Event::default().data(json_payload))
            .await
            .map_err(|_| Self::disconnected())
    }

    async fn send_event(&mut self, name: &str, json_payload: String) -> RaspResult<()> {
        self.tx
            .send(Event::default().event(name).data(json_payload))
            .await
            .map_err(|_| Self::disconnected())
    }

    async fn flush(&mut self) -> RaspResult<()> {
        Ok(())
    }
}
