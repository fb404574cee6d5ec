//! User lookups for stream authentication

use sqlx::SqlitePool;

use crate::{errors::AppResult, models::User};

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, max_connections, expires_at, is_active
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Playlists assigned to a user; `kind` is "live" or "vod".
    pub async fn playlist_ids(&self, user_id: i64, kind: &str) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT playlist_id FROM user_playlists
            WHERE user_id = ? AND kind = ?
            ORDER BY playlist_id
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
