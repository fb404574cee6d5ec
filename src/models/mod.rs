use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Upstream provider kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    M3u,
    Xtream,
    Epg,
}

/// One upstream provider. `priority` orders variant selection (lower wins),
/// `max_streams` caps concurrent sessions against this source (0 = unlimited).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    pub username: Option<String>,
    pub password: Option<String>,
    pub priority: i64,
    pub max_streams: i64,
}

/// Video quality tag parsed out of a raw channel name.
///
/// The rank drives variant ordering: lower is better. Channels with no
/// recognizable tag sort last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Uhd,
    Fhd,
    Hd,
    Sd,
    Unknown,
}

impl Quality {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "UHD" => Quality::Uhd,
            "FHD" => Quality::Fhd,
            "HD" => Quality::Hd,
            "SD" => Quality::Sd,
            _ => Quality::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Uhd => "UHD",
            Quality::Fhd => "FHD",
            Quality::Hd => "HD",
            Quality::Sd => "SD",
            Quality::Unknown => "",
        }
    }

    pub fn rank(&self) -> i64 {
        match self {
            Quality::Uhd => 1,
            Quality::Fhd => 2,
            Quality::Hd => 3,
            Quality::Sd => 4,
            Quality::Unknown => 5,
        }
    }
}

/// Rank for a quality tag as stored in the catalog (`""` for untagged).
pub fn quality_rank(tag: &str) -> i64 {
    Quality::from_tag(tag).rank()
}

/// A raw channel as ingested from one source. `normalized_name` is a pure
/// function of the cleaned display name; two rows sharing it are variants
/// of the same logical channel regardless of source.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SourceChannel {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    pub tvg_name: String,
    pub tvg_logo: Option<String>,
    pub group_title: Option<String>,
    pub quality: String,
    pub normalized_name: String,
}

/// A channel in a user-facing curated playlist. Its id is what downstream
/// stream URLs embed; the URL stays in sync with the backing SourceChannel.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlaylistChannel {
    pub id: i64,
    pub playlist_id: i64,
    pub source_id: i64,
    pub url: String,
    pub tvg_name: String,
    pub tvg_id: Option<String>,
    pub tvg_logo: Option<String>,
    pub group_title: Option<String>,
    pub sort_order: Option<i64>,
}

/// A downstream account. `max_connections` of 0 means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub max_connections: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl User {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry < now)
    }
}

/// One playable variant for a logical channel, annotated at resolution time
/// with the number of live sessions currently held against its source.
#[derive(Debug, Clone)]
pub struct Variant {
    pub source_channel_id: i64,
    pub url: String,
    pub tvg_name: String,
    pub quality: String,
    pub source_id: i64,
    pub source_priority: i64,
    pub source_max_streams: i64,
    pub active_count: usize,
}

impl Variant {
    /// A source with `max_streams == 0` never fills up.
    pub fn has_capacity(&self) -> bool {
        self.source_max_streams == 0 || (self.active_count as i64) < self.source_max_streams
    }

    pub fn quality_rank(&self) -> i64 {
        quality_rank(&self.quality)
    }
}

/// A user-defined find/replace applied to raw channel names before
/// normalization. Literal unless `is_regex` is set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChannelCleanupRule {
    pub id: i64,
    pub source_id: Option<i64>,
    pub find_pattern: String,
    pub replace_with: String,
    pub is_regex: bool,
    pub is_enabled: bool,
    pub sort_order: i64,
}

/// Append-only record of one finished authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StreamHistoryEntry {
    pub id: i64,
    pub username: String,
    pub channel_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_s: i64,
}

/// Failure counter per (channel, url) pair. Observability only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailedStreamEntry {
    pub channel_id: i64,
    pub url: String,
    pub fail_count: i64,
    pub last_error: Option<String>,
    pub last_status: Option<i64>,
}

/// Snapshot of one live session as exposed by `GET /api/streams`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStreamInfo {
    pub channel_id: i64,
    pub channel_name: String,
    pub source_id: i64,
    pub username: Option<String>,
    pub clients: usize,
    pub started_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bitrate: u64,
    pub reconnects: u32,
    pub upstream_url: String,
}
