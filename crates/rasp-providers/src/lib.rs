//! HTTP adapters and fakes for the three external providers RASP depends on.

mod completion;
mod embedding;
mod retry;
mod vector_store;

pub use completion::{CompletionClient, DeltaStream, FakeCompletionClient, HttpCompletionClient};
pub use embedding::{EmbeddingClient, FakeEmbeddingClient, HttpEmbeddingClient};
pub use retry::{backoff_delay, call_with_retry, create_stream_with_retry, wait_with_cancellation};
pub use vector_store::{FakeVectorStoreClient, HttpVectorStoreClient, VectorStoreClient};
