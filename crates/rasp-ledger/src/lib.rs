//! BalanceLedger (spec §4.4, C4): atomic check-and-deduct credit accounting.

mod sqlite;

use async_trait::async_trait;
use rasp_core::{RaspError, RaspResult, UserId};

/// Quote/Reserve/Refund/Current over a per-user character balance.
///
/// `Reserve` and `Refund` must serialize per user (a single-writer
/// connection satisfies this trivially). Invariant: for every successful
/// `reserve(x)` in a session, either the session commits (no refund), or at
/// most one `refund(y)` with `y <= x` occurs.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Pure: `max(question_len, min_charge)`.
    fn quote(&self, question_len: usize, min_charge: i64) -> i64 {
        std::cmp::max(question_len as i64, min_charge)
    }

    /// Atomically checks `current_balance >= charge`; if so, decrements by
    /// `charge` and returns the new balance. Never drives balance negative.
    async fn reserve(&self, user_id: UserId, charge: i64) -> RaspResult<i64>;

    /// Increments `current_balance` by `amount`, clamped to `total_balance`.
    async fn refund(&self, user_id: UserId, amount: i64) -> RaspResult<()>;

    /// Returns `(current_balance, total_balance)`.
    async fn current(&self, user_id: UserId) -> RaspResult<(i64, i64)>;
}

pub use sqlite::SqliteBalanceLedger;

pub(crate) fn insufficient_balance(charge: i64) -> RaspError {
    RaspError::InsufficientBalance { required: charge }
}
