//! Append-only accounting: stream history and failed variant attempts
//!
//! Both writes are best-effort. A failing insert is logged and swallowed by
//! the caller; it must never take down a pump or a request handler.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::errors::AppResult;

#[derive(Debug, Clone)]
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one finished authenticated session.
    pub async fn record_stream_history(
        &self,
        username: &str,
        channel_id: i64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let duration_s = (ended_at - started_at).num_seconds().max(0);

        sqlx::query(
            r#"
            INSERT INTO stream_history (username, channel_id, started_at, ended_at, duration_s)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(username)
        .bind(channel_id)
        .bind(started_at.to_rfc3339())
        .bind(ended_at.to_rfc3339())
        .bind(duration_s)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bump the failure counter for one (channel, url) pair.
    pub async fn record_failed_stream(
        &self,
        channel_id: i64,
        url: &str,
        error: &str,
        status: Option<u16>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_streams (channel_id, url, fail_count, last_error, last_status, last_failed_at)
            VALUES (?, ?, 1, ?, ?, datetime('now'))
            ON CONFLICT (channel_id, url) DO UPDATE SET
                fail_count = fail_count + 1,
                last_error = excluded.last_error,
                last_status = excluded.last_status,
                last_failed_at = excluded.last_failed_at
            "#,
        )
        .bind(channel_id)
        .bind(url)
        .bind(error)
        .bind(status.map(|s| s as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
