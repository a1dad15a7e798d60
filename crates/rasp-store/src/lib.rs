//! ChatStore (spec §4.5, C5): chat/message persistence with ownership checks.

mod sqlite;

use async_trait::async_trait;
use rasp_core::{Chat, ChatId, Message, RaspResult, UserId};

/// Persists chats and messages with per-user ownership.
///
/// `append_messages` writes the user and assistant message atomically: a
/// chat never contains a user question without an assistant reply or
/// vice versa.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn owns_chat(&self, user_id: UserId, chat_id: ChatId) -> RaspResult<bool>;

    async fn create_chat(&self, user_id: UserId, title: &str) -> RaspResult<Chat>;

    async fn append_messages(
        &self,
        chat_id: ChatId,
        user_content: &str,
        assistant_content: &str,
        sources: &[String],
    ) -> RaspResult<()>;

    async fn list_chats(&self, user_id: UserId, limit: i64, offset: i64) -> RaspResult<(Vec<Chat>, i64)>;

    async fn list_messages(&self, chat_id: ChatId) -> RaspResult<Vec<Message>>;

    async fn delete_chat(&self, user_id: UserId, chat_id: ChatId) -> RaspResult<()>;
}

pub use sqlite::SqliteChatStore;
