//! StreamOrchestrator (spec §4.6, C6): the coroutine bound to one client
//! connection, tying together retrieval, completion, billing and persistence.

mod buffer;
mod orchestrator;
mod sink;

pub use buffer::CoalescingBuffer;
pub use orchestrator::StreamOrchestrator;
pub use sink::{RecordingSink, SinkFrame, StreamSink};
