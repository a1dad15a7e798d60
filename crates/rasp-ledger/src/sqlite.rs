use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rasp_core::{RaspError, RaspResult, UserId};
use rusqlite::Connection;

use crate::{insufficient_balance, BalanceLedger};

/// `BalanceLedger` backed by SQLite. Holds the connection behind a single
/// mutex so `reserve`/`refund` on the same (or different) users serialize
/// through one writer — stronger than the per-user requirement, but SQLite
/// only supports one writer at a time regardless.
pub struct SqliteBalanceLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBalanceLedger {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RaspResult<Self> {
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> RaspResult<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY,
                    plan TEXT NOT NULL DEFAULT 'free',
                    current_balance INTEGER NOT NULL DEFAULT 0,
                    total_balance INTEGER NOT NULL DEFAULT 0,
                    is_admin INTEGER NOT NULL DEFAULT 0
                );",
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
        .map_err(|e| RaspError::Internal(format!("ledger task join error: {e}")))?
    }
}

fn db_err(err: rusqlite::Error) -> RaspError {
    RaspError::Storage(err.to_string())
}

#[async_trait]
impl BalanceLedger for SqliteBalanceLedger {
    async fn reserve(&self, user_id: UserId, charge: i64) -> RaspResult<i64> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let current: i64 = tx
                .query_row(
                    "SELECT current_balance FROM users WHERE id = ?1",
                    [user_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        RaspError::Validation(format!("unknown user {user_id}"))
                    }
                    other => db_err(other),
                })?;

            if current < charge {
                return Err(insufficient_balance(charge));
            }

            let new_balance = current - charge;
            tx.execute(
                "UPDATE users SET current_balance = ?1 WHERE id = ?2",
                rusqlite::params![new_balance, user_id],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(new_balance)
        })
        .await
    }

    async fn refund(&self, user_id: UserId, amount: i64) -> RaspResult<()> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let (current, total): (i64, i64) = tx
                .query_row(
                    "SELECT current_balance, total_balance FROM users WHERE id = ?1",
                    [user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        RaspError::Validation(format!("unknown user {user_id}"))
                    }
                    other => db_err(other),
                })?;

            let new_balance = std::cmp::min(current + amount, total);
            tx.execute(
                "UPDATE users SET current_balance = ?1 WHERE id = ?2",
                rusqlite::params![new_balance, user_id],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn current(&self, user_id: UserId) -> RaspResult<(i64, i64)> {
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT current_balance, total_balance FROM users WHERE id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    RaspError::Validation(format!("unknown user {user_id}"))
                }
                other => db_err(other),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_user(balance: i64, total: i64) -> SqliteBalanceLedger {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = SqliteBalanceLedger::new(Arc::new(Mutex::new(conn))).unwrap();
        ledger
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO users (id, current_balance, total_balance) VALUES (1, ?1, ?2)",
                rusqlite::params![balance, total],
            )
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn reserve_deducts_when_sufficient() {
        let ledger = ledger_with_user(1000, 2000);
        let new_balance = ledger.reserve(1, 50).await.unwrap();
        assert_eq!(new_balance, 950);
        assert_eq!(ledger.current(1).await.unwrap(), (950, 2000));
    }

    #[tokio::test]
    async fn reserve_fails_when_insufficient() {
        let ledger = ledger_with_user(30, 2000);
        let err = ledger.reserve(1, 50).await.unwrap_err();
        assert!(matches!(err, RaspError::InsufficientBalance { required: 50 }));
        assert_eq!(ledger.current(1).await.unwrap(), (30, 2000));
    }

    #[tokio::test]
    async fn reserve_allows_exact_balance() {
        let ledger = ledger_with_user(50, 2000);
        let new_balance = ledger.reserve(1, 50).await.unwrap();
        assert_eq!(new_balance, 0);
    }

    #[tokio::test]
    async fn refund_clamps_to_total_balance() {
        let ledger = ledger_with_user(1990, 2000);
        ledger.refund(1, 50).await.unwrap();
        assert_eq!(ledger.current(1).await.unwrap(), (2000, 2000));
    }

    #[tokio::test]
    async fn refund_after_reserve_restores_balance() {
        let ledger = ledger_with_user(1000, 2000);
        ledger.reserve(1, 50).await.unwrap();
        ledger.refund(1, 50).await.unwrap();
        assert_eq!(ledger.current(1).await.unwrap(), (1000, 2000));
    }

    #[test]
    fn quote_uses_min_charge_floor() {
        let ledger = ledger_with_user(1000, 2000);
        assert_eq!(ledger.quote(17, 50), 50);
        assert_eq!(ledger.quote(80, 50), 80);
    }
}
