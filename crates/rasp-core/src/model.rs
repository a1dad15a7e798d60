use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

/// A subscription plan. Each variant maps to a starting `total_balance` quota
/// owned by the adjacent billing surface; RASP only ever reads balances
/// through [`crate::BalanceLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Basic,
    Pro,
    Unlimited,
}

/// Stable user identity and credit balance.
///
/// Invariant: `0 <= current_balance <= total_balance` at every quiescent
/// point; balance changes occur only through `BalanceLedger` operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub plan: Plan,
    pub current_balance: i64,
    pub total_balance: i64,
    pub is_admin: bool,
}

/// A chat accessible only to its `owner_user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub owner_user_id: UserId,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A persisted message. Assistant messages are written only after a
/// successful terminal completion event and are never partial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Ordered, distinct source labels cited by an assistant message.
    /// Always empty for user messages.
    pub sources: Vec<String>,
}

/// A read-only passage returned by the vector store. Never mutated by core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub passage_id: String,
    pub text: String,
    pub source_label: String,
}

/// One scored hit from a top-K retrieval, transient and never persisted
/// beyond the enclosing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub passage: Passage,
    pub score: f32,
}
