//! Variant resolution and admission control
//!
//! Given a requested playlist channel, produce the ordered list of upstream
//! URLs worth trying: every source channel sharing the normalized name,
//! annotated with the live session count against its source, available
//! capacity first. Admission re-checks capacity at the moment a new session
//! would actually be created, because counts move between resolution and
//! creation.

use std::sync::Arc;
use tracing::debug;

use crate::{
    errors::StreamError,
    models::{User, Variant},
    repositories::CatalogRepository,
};

use super::registry::SessionRegistry;

pub struct VariantResolver {
    catalog: CatalogRepository,
    registry: Arc<SessionRegistry>,
}

impl VariantResolver {
    pub fn new(catalog: CatalogRepository, registry: Arc<SessionRegistry>) -> Self {
        Self { catalog, registry }
    }

    /// Ordered candidate list for one logical channel.
    ///
    /// Variants with free capacity come first, each group ordered by
    /// `(source_priority, quality_rank)`. Full variants stay in the list as
    /// last-resort fallbacks: admission will reject them unless their
    /// source freed up in the meantime.
    pub async fn resolve_variants(&self, channel_id: i64) -> Result<Vec<Variant>, StreamError> {
        let channel = self
            .catalog
            .lookup_playlist_channel(channel_id)
            .await?
            .ok_or(StreamError::ChannelNotFound(channel_id))?;

        let source_channel = self.catalog.lookup_source_channel_by_url(&channel.url).await?;

        let mut variants = match &source_channel {
            Some(sc) if !sc.normalized_name.is_empty() => {
                self.catalog.list_variants(&sc.normalized_name).await?
            }
            _ => {
                // No identity to deduplicate on: the channel stands alone.
                let source = self.catalog.lookup_source(channel.source_id).await?;
                vec![Variant {
                    source_channel_id: source_channel.as_ref().map(|sc| sc.id).unwrap_or(0),
                    url: channel.url.clone(),
                    tvg_name: channel.tvg_name.clone(),
                    quality: String::new(),
                    source_id: channel.source_id,
                    source_priority: source.as_ref().map(|s| s.priority).unwrap_or(999),
                    source_max_streams: source.map(|s| s.max_streams).unwrap_or(0),
                    active_count: 0,
                }]
            }
        };

        for variant in &mut variants {
            variant.active_count = self
                .registry
                .active_count_for_source(variant.source_id)
                .await;
        }

        // The catalog already orders by (priority, quality_rank); a stable
        // partition keeps that order inside each group.
        let (available, full): (Vec<_>, Vec<_>) =
            variants.into_iter().partition(Variant::has_capacity);

        debug!(
            channel_id,
            available = available.len(),
            full = full.len(),
            "Resolved stream variants"
        );

        let mut ordered = available;
        ordered.extend(full);
        Ok(ordered)
    }

    /// Capacity gate for creating a fresh session against this variant's
    /// source. Joining an existing session never goes through here.
    pub async fn check_source_capacity(&self, variant: &Variant) -> Result<(), StreamError> {
        if variant.source_max_streams == 0 {
            return Ok(());
        }
        let active = self
            .registry
            .active_count_for_source(variant.source_id)
            .await;
        if (active as i64) >= variant.source_max_streams {
            return Err(StreamError::SourceAtCapacity {
                source_id: variant.source_id,
                max: variant.source_max_streams,
            });
        }
        Ok(())
    }

    /// Per-user session ceiling; checked before any variant iteration
    /// because no alternate source can help an over-limit user.
    pub async fn check_user_capacity(&self, user: &User) -> Result<(), StreamError> {
        if user.max_connections == 0 {
            return Ok(());
        }
        let active = self.registry.active_count_for_user(&user.username).await;
        if (active as i64) >= user.max_connections {
            return Err(StreamError::UserAtCapacity {
                username: user.username.clone(),
                max: user.max_connections,
            });
        }
        Ok(())
    }
}
