//! Stream gateway: variant failover and client attachment
//!
//! The entry point for every stream request. Joins an existing session for
//! the channel when one is live; otherwise walks the resolved variant list,
//! re-checking source capacity per attempt, until one upstream delivers a
//! first byte within the start window. Failed attempts are recorded per
//! (channel, url); failover stops the moment a session commits to a
//! variant.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::StreamingConfig,
    errors::{AppError, StreamError},
    models::{ActiveStreamInfo, User},
    repositories::{CatalogRepository, HistoryRepository},
};

use super::{
    registry::SessionRegistry,
    resolver::VariantResolver,
    session::{ClientMeta, SessionEvent, SessionParams, SessionSettings, StreamSession},
};

/// Detaches its client when dropped, so a downstream disconnect releases
/// the session slot within one chunk interval no matter how the response
/// future ends.
#[derive(Debug)]
pub struct ClientGuard {
    session: Arc<StreamSession>,
    client_id: Uuid,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let session = self.session.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            session.detach(client_id).await;
        });
    }
}

/// An attached client: the bridge to replay, the live subscription, and the
/// guard keeping the attachment alive.
#[derive(Debug)]
pub struct StreamHandle {
    pub session: Arc<StreamSession>,
    pub bridge: Bytes,
    pub receiver: broadcast::Receiver<SessionEvent>,
    pub guard: ClientGuard,
}

pub struct StreamGateway {
    catalog: CatalogRepository,
    history: HistoryRepository,
    registry: Arc<SessionRegistry>,
    resolver: VariantResolver,
    http: reqwest::Client,
    config: StreamingConfig,
}

impl StreamGateway {
    pub fn new(
        catalog: CatalogRepository,
        history: HistoryRepository,
        registry: Arc<SessionRegistry>,
        config: StreamingConfig,
    ) -> Result<Self, AppError> {
        // Live streams stay open indefinitely: connect timeout only.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build upstream client: {e}")))?;

        let resolver = VariantResolver::new(catalog.clone(), registry.clone());

        Ok(Self {
            catalog,
            history,
            registry,
            resolver,
            http,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Shared upstream client, also used by the Range-request VOD path that
    /// opts out of session sharing.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Resolve, admit and attach. `user` carries the authenticated identity
    /// when credentials were presented; anonymous requests still respect
    /// source capacity. Variant-local failures move the walk to the next
    /// candidate; any other failure aborts the walk immediately.
    pub async fn open_stream(
        &self,
        channel_id: i64,
        user: Option<&User>,
        meta: ClientMeta,
        is_vod: bool,
    ) -> Result<StreamHandle, StreamError> {
        if let Some(user) = user {
            // No variant can help an over-limit user; fail before resolving.
            self.resolver.check_user_capacity(user).await?;
        }

        let variants = self.resolver.resolve_variants(channel_id).await?;
        let mut attempts = 0usize;

        for variant in &variants {
            // An existing session already committed to an upstream; join it
            // whatever variant this iteration holds.
            if let Some(session) = self.registry.get(channel_id).await {
                if !session.is_dead() {
                    return Ok(self.join(session, meta).await);
                }
            }

            attempts += 1;

            if let Err(e) = self.resolver.check_source_capacity(variant).await {
                debug!(
                    channel_id,
                    source_id = variant.source_id,
                    "Variant rejected: {e}"
                );
                self.record_failure(channel_id, &variant.url, &e).await;
                if !e.is_variant_retryable() {
                    return Err(e);
                }
                continue;
            }

            let settings = self.session_settings().await;
            let params = SessionParams {
                channel_id,
                channel_name: variant.tvg_name.clone(),
                upstream_url: variant.url.clone(),
                source_id: variant.source_id,
                username: user.map(|u| u.username.clone()),
                is_vod,
                settings,
                http: self.http.clone(),
                history: self.history.clone(),
                registry: Arc::downgrade(&self.registry),
            };

            let (session, created) = self
                .registry
                .get_or_create(channel_id, || StreamSession::new(params))
                .await;

            if !created {
                // Lost the creation race; the winner's upstream serves us.
                return Ok(self.join(session, meta).await);
            }

            let start_timeout = Duration::from_millis(self.config.start_timeout_ms);
            match session.start(start_timeout).await {
                Ok(()) => return Ok(self.join(session, meta).await),
                Err(e) => {
                    session.destroy("start failed").await;
                    warn!(
                        channel_id,
                        url = variant.url.as_str(),
                        "Variant failed before first byte: {e}"
                    );
                    self.record_failure(channel_id, &variant.url, &e).await;
                    if !e.is_variant_retryable() {
                        return Err(e);
                    }
                }
            }
        }

        Err(StreamError::AllVariantsFailed { attempts })
    }

    /// Terminate a live session by channel id. Returns false when none
    /// exists.
    pub async fn kill_session(&self, channel_id: i64) -> bool {
        match self.registry.get(channel_id).await {
            Some(session) => {
                session.destroy("terminated via api").await;
                true
            }
            None => false,
        }
    }

    pub async fn active_streams(&self) -> Vec<ActiveStreamInfo> {
        let sessions = self.registry.snapshot().await;
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by_key(|info| info.channel_id);
        infos
    }

    async fn join(&self, session: Arc<StreamSession>, meta: ClientMeta) -> StreamHandle {
        let (client_id, bridge, receiver) = session.attach(meta).await;
        StreamHandle {
            guard: ClientGuard {
                session: session.clone(),
                client_id,
            },
            session,
            bridge,
            receiver,
        }
    }

    /// Settings snapshot for a new session; the catalog override of the
    /// pre-buffer window wins over the static config.
    async fn session_settings(&self) -> SessionSettings {
        let mut settings = SessionSettings::from_config(&self.config);
        if let Ok(Some(seconds)) = self.catalog.pre_buffer_seconds_override().await {
            settings.pre_buffer_seconds = seconds;
        }
        settings
    }

    async fn record_failure(&self, channel_id: i64, url: &str, error: &StreamError) {
        if let Err(e) = self
            .history
            .record_failed_stream(channel_id, url, &error.to_string(), error.upstream_status())
            .await
        {
            warn!(channel_id, "Failed to record stream failure: {e}");
        }
    }
}
