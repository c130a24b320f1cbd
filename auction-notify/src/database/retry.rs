//! Busy-retry helper for SQLite writes.
//!
//! Concurrent ledger inserts from several pipeline tasks can hit
//! `SQLITE_BUSY`/`SQLITE_LOCKED` past the busy timeout. Those are retried with
//! capped exponential backoff; every other error is returned immediately.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 10;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

/// Whether `err` is SQLite reporting a locked or busy database.
pub fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED
    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

fn busy_backoff(attempt: u32) -> Duration {
    let capped = BUSY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(20))
        .min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (capped / 4 + 1);
    Duration::from_millis((capped + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying while SQLite reports busy.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy_error(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = busy_backoff(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = BUSY_MAX_RETRIES,
                    ?delay,
                    "SQLite busy, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
