use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rasp_core::{Chat, ChatId, Message, RaspError, RaspResult, Role, UserId};
use rusqlite::{Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::ChatStore;

/// `ChatStore` backed by SQLite, following the same
/// `Arc<Mutex<Connection>>` + `spawn_blocking` pattern as `SqliteBalanceLedger`
/// — the two may share a connection since SQLite serializes writers anyway.
pub struct SqliteChatStore {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(err: rusqlite::Error) -> RaspError {
    RaspError::Storage(err.to_string())
}

fn format_rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .expect("OffsetDateTime always formats as rfc3339")
}

fn parse_rfc3339(raw: &str) -> RaspResult<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map_err(|e| RaspError::Storage(format!("invalid stored timestamp: {e}")))
}

fn map_row_to_chat(row: &rusqlite::Row) -> Result<(ChatId, UserId, String, String), rusqlite::Error> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

impl SqliteChatStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RaspResult<Self> {
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> RaspResult<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS chats (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_chats_user_id ON chats(user_id);

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    chat_id INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    sources_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id);",
            )
            .map_err(db_err)
    }

    async fn run_blocking<F, R>(&self, f: F) -> RaspResult<R>
    where
        F: FnOnce(&mut Connection) -> RaspResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn_arc = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn_arc.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| RaspError::Internal(format!("store task join error: {e}")))?
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn owns_chat(&self, user_id: UserId, chat_id: ChatId) -> RaspResult<bool> {
        self.run_blocking(move |conn| {
            let owner: Option<UserId> = conn
                .query_row("SELECT user_id FROM chats WHERE id = ?1", [chat_id], |row| row.get(0))
                .optional()
                .map_err(db_err)?;
            Ok(owner == Some(user_id))
        })
        .await
    }

    async fn create_chat(&self, user_id: UserId, title: &str) -> RaspResult<Chat> {
        let title = title.to_string();
        self.run_blocking(move |conn| {
            let now = OffsetDateTime::now_utc();
            conn.execute(
                "INSERT INTO chats (user_id, title, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, title, format_rfc3339(now)],
            )
            .map_err(db_err)?;
            Ok(Chat {
                id: conn.last_insert_rowid(),
                owner_user_id: user_id,
                title,
                created_at: now,
            })
        })
        .await
    }

    async fn append_messages(
        &self,
        chat_id: ChatId,
        user_content: &str,
        assistant_content: &str,
        sources: &[String],
    ) -> RaspResult<()> {
        let user_content = user_content.to_string();
        let assistant_content = assistant_content.to_string();
        let sources_json = serde_json::to_string(sources)
            .map_err(|e| RaspError::Internal(format!("failed to serialize sources: {e}")))?;

        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let now = format_rfc3339(OffsetDateTime::now_utc());
            tx.execute(
                "INSERT INTO messages (chat_id, role, content, sources_json, created_at)
                 VALUES (?1, 'user', ?2, '[]', ?3)",
                rusqlite::params![chat_id, user_content, now],
            )
            .map_err(db_err)?;
            tx.execute(
                "INSERT INTO messages (chat_id, role, content, sources_json, created_at)
                 VALUES (?1, 'assistant', ?2, ?3, ?4)",
                rusqlite::params![chat_id, assistant_content, sources_json, now],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn list_chats(&self, user_id: UserId, limit: i64, offset: i64) -> RaspResult<(Vec<Chat>, i64)> {
        self.run_blocking(move |conn| {
            let total: i64 = conn
                .query_row("SELECT COUNT(*) FROM chats WHERE user_id = ?1", [user_id], |row| row.get(0))
                .map_err(db_err)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, title, created_at FROM chats
                     WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], map_row_to_chat)
                .map_err(db_err)?;

            let mut chats = Vec::new();
            for row in rows {
                let (id, owner_user_id, title, created_at) = row.map_err(db_err)?;
                chats.push(Chat {
                    id,
                    owner_user_id,
                    title,
                    created_at: parse_rfc3339(&created_at)?,
                });
            }
            Ok((chats, total))
        })
        .await
    }

    async fn list_messages(&self, chat_id: ChatId) -> RaspResult<Vec<Message>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_id, role, content, sources_json, created_at
                     FROM messages WHERE chat_id = ?1 ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([chat_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db_err)?;

            let mut messages = Vec::new();
            for row in rows {
                let (id, chat_id, role, content, sources_json, created_at) = row.map_err(db_err)?;
                let role = match role.as_str() {
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    other => return Err(RaspError::Storage(format!("unknown message role {other}"))),
                };
                let sources: Vec<String> = serde_json::from_str(&sources_json)
                    .map_err(|e| RaspError::Storage(format!("invalid stored sources: {e}")))?;
                messages.push(Message {
                    id,
                    chat_id,
                    role,
                    content,
                    created_at: parse_rfc3339(&created_at)?,
                    sources,
                });
            }
            Ok(messages)
        })
        .await
    }

    async fn delete_chat(&self, user_id: UserId, chat_id: ChatId) -> RaspResult<()> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let owner: Option<UserId> = tx
                .query_row("SELECT user_id FROM chats WHERE id = ?1", [chat_id], |row| row.get(0))
                .optional()
                .map_err(db_err)?;
            match owner {
                None => return Err(RaspError::Storage(format!("chat {chat_id} not found"))),
                Some(owner) if owner != user_id => {
                    return Err(RaspError::NotOwner { user_id, chat_id });
                }
                Some(_) => {}
            }
            tx.execute("DELETE FROM messages WHERE chat_id = ?1", [chat_id]).map_err(db_err)?;
            tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id]).map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteChatStore {
        let conn = Connection::open_in_memory().unwrap();
        SqliteChatStore::new(Arc::new(Mutex::new(conn))).unwrap()
    }

    #[tokio::test]
    async fn create_and_own_chat() {
        let store = store();
        let chat = store.create_chat(1, "First chat").await.unwrap();
        assert!(store.owns_chat(1, chat.id).await.unwrap());
        assert!(!store.owns_chat(2, chat.id).await.unwrap());
    }

    #[tokio::test]
    async fn append_messages_is_atomic_pair() {
        let store = store();
        let chat = store.create_chat(1, "Chat").await.unwrap();
        store
            .append_messages(chat.id, "What is sepsis?", "Sepsis is...", &["Doc A".to_string()])
            .await
            .unwrap();
        let messages = store.list_messages(chat.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].sources, vec!["Doc A".to_string()]);
    }

    #[tokio::test]
    async fn list_chats_reports_total_and_page() {
        let store = store();
        for i in 0..5 {
            store.create_chat(1, &format!("Chat {i}")).await.unwrap();
        }
        let (page, total) = store.list_chats(1, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn delete_chat_requires_ownership() {
        let store = store();
        let chat = store.create_chat(1, "Chat").await.unwrap();
        let err = store.delete_chat(2, chat.id).await.unwrap_err();
        assert!(matches!(err, RaspError::NotOwner { .. }));
        assert!(store.owns_chat(1, chat.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_chat_cascades_to_messages() {
        let store = store();
        let chat = store.create_chat(1, "Chat").await.unwrap();
        store.append_messages(chat.id, "q", "a", &[]).await.unwrap();
        store.delete_chat(1, chat.id).await.unwrap();
        assert!(store.list_messages(chat.id).await.unwrap().is_empty());
    }
}
