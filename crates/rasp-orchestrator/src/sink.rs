use async_trait::async_trait;
use rasp_core::RaspResult;

/// The push-channel bound to one client connection (spec §4.6). A write
/// failure (the client gone) must surface as `RaspError::Cancelled` so the
/// orchestrator aborts the same way it would on an explicit disconnect.
#[async_trait]
pub trait StreamSink: Send {
    /// Sends one unnamed SSE frame: `data: <json_payload>\n\n`.
    async fn send_data(&mut self, json_payload: String) -> RaspResult<()>;

    /// Sends a named SSE frame: `event: <name>\ndata: <json_payload>\n\n`.
    async fn send_event(&mut self, name: &str, json_payload: String) -> RaspResult<()>;

    async fn flush(&mut self) -> RaspResult<()>;
}

/// In-memory [`StreamSink`] that records every frame, for orchestrator tests.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Vec<SinkFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFrame {
    Data(String),
    Event(String, String),
}

#[async_trait]
impl StreamSink for RecordingSink {
    async fn send_data(&mut self, json_payload: String) -> RaspResult<()> {
        self.frames.push(SinkFrame::Data(json_payload));
        Ok(())
    }

    async fn send_event(&mut self, name: &str, json_payload: String) -> RaspResult<()> {
        self.frames.push(SinkFrame::Event(name.to_string(), json_payload));
        Ok(())
    }

    async fn flush(&mut self) -> RaspResult<()> {
        Ok(())
    }
}
