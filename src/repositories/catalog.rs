//! Catalog lookups backing channel resolution
//!
//! All reads on the stream-request hot path live here: playlist channel by
//! id, source channel by URL, and the indexed variant lookup by normalized
//! name. The variant query carries the ordering contract: source priority
//! first, then quality rank.

use sqlx::{Row, SqlitePool};

use crate::{
    errors::AppResult,
    models::{ChannelCleanupRule, PlaylistChannel, Source, SourceChannel, Variant},
};

#[derive(Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn lookup_playlist_channel(&self, id: i64) -> AppResult<Option<PlaylistChannel>> {
        let channel = sqlx::query_as::<_, PlaylistChannel>(
            r#"
            SELECT id, playlist_id, source_id, url, tvg_name, tvg_id, tvg_logo,
                   group_title, sort_order
            FROM playlist_channels
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(channel)
    }

    pub async fn lookup_source(&self, id: i64) -> AppResult<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(
            r#"
            SELECT id, name, kind, username, password, priority, max_streams
            FROM sources
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(source)
    }

    pub async fn lookup_source_channel_by_url(
        &self,
        url: &str,
    ) -> AppResult<Option<SourceChannel>> {
        let channel = sqlx::query_as::<_, SourceChannel>(
            r#"
            SELECT id, source_id, url, tvg_name, tvg_logo, group_title,
                   quality, normalized_name
            FROM source_channels
            WHERE url = ?
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(channel)
    }

    /// All variants sharing a normalized name, ordered by
    /// `(source_priority ASC, quality_rank ASC)`. `active_count` is zeroed
    /// here; the resolver annotates it from the session registry.
    pub async fn list_variants(&self, normalized_name: &str) -> AppResult<Vec<Variant>> {
        let rows = sqlx::query(
            r#"
            SELECT sc.id AS source_channel_id,
                   sc.url,
                   sc.tvg_name,
                   sc.quality,
                   sc.source_id,
                   s.priority AS source_priority,
                   s.max_streams AS source_max_streams
            FROM source_channels sc
            JOIN sources s ON s.id = sc.source_id
            WHERE sc.normalized_name = ?
            ORDER BY s.priority ASC,
                     CASE sc.quality
                         WHEN 'UHD' THEN 1
                         WHEN 'FHD' THEN 2
                         WHEN 'HD' THEN 3
                         WHEN 'SD' THEN 4
                         ELSE 5
                     END ASC,
                     sc.id ASC
            "#,
        )
        .bind(normalized_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Variant {
                source_channel_id: row.get("source_channel_id"),
                url: row.get("url"),
                tvg_name: row.get("tvg_name"),
                quality: row.get("quality"),
                source_id: row.get("source_id"),
                source_priority: row.get("source_priority"),
                source_max_streams: row.get("source_max_streams"),
                active_count: 0,
            })
            .collect())
    }

    /// Enabled cleanup rules in application order. Global rules
    /// (`source_id IS NULL`) apply to every source.
    pub async fn cleanup_rules(&self, source_id: Option<i64>) -> AppResult<Vec<ChannelCleanupRule>> {
        let rules = sqlx::query_as::<_, ChannelCleanupRule>(
            r#"
            SELECT id, source_id, find_pattern, replace_with, is_regex,
                   is_enabled, sort_order
            FROM channel_cleanup_rules
            WHERE is_enabled = 1 AND (source_id IS NULL OR source_id = ?)
            ORDER BY sort_order ASC, id ASC
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    pub async fn setting(&self, key: &str) -> AppResult<Option<String>> {
        let value =
            sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    /// Dynamic pre-buffer window from the settings map, if present. Read at
    /// session creation so changes take effect on new sessions only.
    pub async fn pre_buffer_seconds_override(&self) -> AppResult<Option<u64>> {
        Ok(self
            .setting("proxy_buffer_seconds")
            .await?
            .and_then(|v| v.parse().ok()))
    }
}
