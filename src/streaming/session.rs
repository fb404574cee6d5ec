//! Stream session: one upstream connection fanned out to N clients
//!
//! A session owns exactly one upstream HTTP connection and a pump task that
//! reads it. The pump meters bytes, fills the pre-buffer during warm-up,
//! feeds the rolling buffer once live, and publishes chunks through a
//! broadcast channel with bounded per-subscriber queues. A subscriber that
//! cannot keep up lags out and is detached; it never back-pressures the
//! pump.
//!
//! A session starts, fills its pre-buffer, goes live, reconnects as needed,
//! and dies. Every teardown path funnels through
//! [`StreamSession::destroy`], which is idempotent: it cancels the upstream
//! request, removes the session from the registry, writes stream history
//! for authenticated sessions, and notifies remaining subscribers with an
//! end event.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::errors::StreamError;
use crate::models::ActiveStreamInfo;
use crate::repositories::HistoryRepository;

use super::prebuffer::PreBuffer;
use super::registry::SessionRegistry;
use super::rolling::{self, RollingBuffer};

/// Fixed upstream identity; some providers whitelist on it.
pub const UPSTREAM_USER_AGENT: &str = "Mozilla/5.0 (compatible; M3UManager/1.0)";

const BROADCAST_CAPACITY: usize = 1024;

/// What subscribers see: live chunks, then a final end marker.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Chunk(Bytes),
    End,
}

/// Per-session tunables, resolved at creation time (so a settings change
/// affects new sessions only).
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub pre_buffer_seconds: u64,
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
    pub stall_timeout: Duration,
    pub vod_grace: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            pre_buffer_seconds: config.pre_buffer_seconds,
            max_reconnects: config.max_reconnects,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            stall_timeout: Duration::from_millis(config.stall_timeout_ms),
            vod_grace: Duration::from_millis(config.vod_grace_ms),
        }
    }
}

/// Downstream client identity, kept for the active-streams listing.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug)]
struct AttachedClient {
    #[allow(dead_code)]
    meta: ClientMeta,
    #[allow(dead_code)]
    connected_at: Instant,
}

/// Everything needed to construct a session. The constructor is synchronous
/// so it can serve as the registry's get-or-create factory.
pub struct SessionParams {
    pub channel_id: i64,
    pub channel_name: String,
    pub upstream_url: String,
    pub source_id: i64,
    pub username: Option<String>,
    pub is_vod: bool,
    pub settings: SessionSettings,
    pub http: reqwest::Client,
    pub history: HistoryRepository,
    pub registry: Weak<SessionRegistry>,
}

#[derive(Debug)]
pub struct StreamSession {
    pub channel_id: i64,
    pub channel_name: String,
    pub upstream_url: String,
    pub source_id: i64,
    pub username: Option<String>,
    pub is_vod: bool,

    started_at: DateTime<Utc>,
    settings: SessionSettings,
    http: reqwest::Client,
    history: HistoryRepository,
    registry: Weak<SessionRegistry>,

    chunk_tx: broadcast::Sender<SessionEvent>,
    /// Guards the rolling buffer AND serializes publish against attach:
    /// a snapshot plus subscription taken under this lock is atomic with
    /// respect to the pump's publish step, so a late joiner sees no gap
    /// and no duplicate at the bridge boundary.
    rolling: Mutex<RollingBuffer>,
    clients: RwLock<HashMap<Uuid, AttachedClient>>,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    reconnects: AtomicU32,
    bitrate: AtomicU64,
    reached_live: AtomicBool,
    dead: AtomicBool,
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn new(params: SessionParams) -> Arc<Self> {
        let (chunk_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let rolling_capacity = rolling::capacity_for_window(params.settings.pre_buffer_seconds);

        Arc::new(Self {
            channel_id: params.channel_id,
            channel_name: params.channel_name,
            upstream_url: params.upstream_url,
            source_id: params.source_id,
            username: params.username,
            is_vod: params.is_vod,
            started_at: Utc::now(),
            settings: params.settings,
            http: params.http,
            history: params.history,
            registry: params.registry,
            chunk_tx,
            rolling: Mutex::new(RollingBuffer::new(rolling_capacity)),
            clients: RwLock::new(HashMap::new()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
            bitrate: AtomicU64::new(0),
            reached_live: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the pump and wait for the first upstream byte. On failure or
    /// timeout the session is destroyed and the caller is free to try the
    /// next variant; once this returns `Ok` the variant is committed.
    pub async fn start(self: &Arc<Self>, start_timeout: Duration) -> Result<(), StreamError> {
        let (first_byte_tx, first_byte_rx) = oneshot::channel();
        tokio::spawn(self.clone().run_pump(first_byte_tx));

        match tokio::time::timeout(start_timeout, first_byte_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::UpstreamUnreachable {
                message: "upstream reader exited before first byte".to_string(),
            }),
            Err(_) => {
                self.destroy("start timeout").await;
                Err(StreamError::UpstreamUnreachable {
                    message: format!("no upstream data within {:?}", start_timeout),
                })
            }
        }
    }

    /// Join a client to the session. Returns the rolling-buffer bridge (the
    /// replayable recent past; empty on a fresh session) and a live
    /// subscription. Taken atomically with respect to publishing.
    pub async fn attach(&self, meta: ClientMeta) -> (Uuid, Bytes, broadcast::Receiver<SessionEvent>) {
        let (bridge, receiver) = {
            let rolling = self.rolling.lock().await;
            (rolling.snapshot(), self.chunk_tx.subscribe())
        };

        let client_id = Uuid::new_v4();
        info!(
            channel_id = self.channel_id,
            client_id = %client_id,
            ip = meta.ip.as_deref().unwrap_or("unknown"),
            user_agent = meta.user_agent.as_deref().unwrap_or(""),
            bridge_bytes = bridge.len(),
            "Client attached to stream session"
        );

        {
            let mut clients = self.clients.write().await;
            clients.insert(
                client_id,
                AttachedClient {
                    meta,
                    connected_at: Instant::now(),
                },
            );
        }

        (client_id, bridge, receiver)
    }

    /// Drop a client. An emptied live session dies immediately; an emptied
    /// VOD session lingers for the grace window to ride out player
    /// reconnect storms.
    pub async fn detach(self: &Arc<Self>, client_id: Uuid) {
        let remaining = {
            let mut clients = self.clients.write().await;
            if clients.remove(&client_id).is_none() {
                return;
            }
            clients.len()
        };

        debug!(
            channel_id = self.channel_id,
            client_id = %client_id,
            clients = remaining,
            "Client detached from stream session"
        );

        if remaining > 0 || self.is_dead() {
            return;
        }

        if self.is_vod {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(session.settings.vod_grace).await;
                if !session.is_dead() && session.client_count().await == 0 {
                    session.destroy("idle after grace period").await;
                }
            });
        } else {
            self.destroy("last client disconnected").await;
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn reached_live(&self) -> bool {
        self.reached_live.load(Ordering::SeqCst)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub async fn info(&self) -> ActiveStreamInfo {
        ActiveStreamInfo {
            channel_id: self.channel_id,
            channel_name: self.channel_name.clone(),
            source_id: self.source_id,
            username: self.username.clone(),
            clients: self.client_count().await,
            started_at: self.started_at,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            bitrate: self.bitrate.load(Ordering::Relaxed),
            reconnects: self.reconnects(),
            upstream_url: self.upstream_url.clone(),
        }
    }

    /// Idempotent teardown: cancel upstream, deregister, account, notify.
    pub async fn destroy(self: &Arc<Self>, reason: &str) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_same(self.channel_id, self).await;
        }

        // Straggling subscribers see a clean end, not an abort.
        let _ = self.chunk_tx.send(SessionEvent::End);

        if self.reached_live() {
            if let Some(username) = &self.username {
                let ended_at = Utc::now();
                if let Err(e) = self
                    .history
                    .record_stream_history(username, self.channel_id, self.started_at, ended_at)
                    .await
                {
                    warn!(
                        channel_id = self.channel_id,
                        username = username.as_str(),
                        "Failed to write stream history: {e}"
                    );
                }
            }
        }

        info!(
            channel_id = self.channel_id,
            source_id = self.source_id,
            reason,
            bytes_in = self.bytes_in(),
            bytes_out = self.bytes_out(),
            reconnects = self.reconnects(),
            "Stream session destroyed"
        );
    }

    // ---- pump -----------------------------------------------------------

    async fn run_pump(self: Arc<Self>, first_byte: oneshot::Sender<Result<(), StreamError>>) {
        let mut first_byte = Some(first_byte);

        let mut prebuffer = if self.settings.pre_buffer_seconds > 0 {
            Some(PreBuffer::new(self.settings.pre_buffer_seconds))
        } else {
            None
        };

        let mut response = match self.fetch_upstream().await {
            Ok(response) => response,
            Err(e) => {
                if let Some(tx) = first_byte.take() {
                    let _ = tx.send(Err(e));
                }
                self.destroy("upstream fetch failed").await;
                return;
            }
        };

        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => Err(StreamError::UpstreamCancelled),
                result = tokio::time::timeout(self.settings.stall_timeout, response.chunk()) => {
                    match result {
                        Err(_) => Err(StreamError::UpstreamStalled),
                        Ok(Ok(maybe_chunk)) => Ok(maybe_chunk),
                        Ok(Err(e)) => Err(StreamError::UpstreamUnreachable {
                            message: e.to_string(),
                        }),
                    }
                }
            };

            match read {
                Ok(Some(chunk)) => {
                    if let Some(tx) = first_byte.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let n = chunk.len() as u64;
                    self.bytes_in.fetch_add(n, Ordering::Relaxed);

                    let elapsed = window_start.elapsed();
                    if elapsed >= Duration::from_secs(1) {
                        let total = self.bytes_in();
                        let rate =
                            ((total - window_bytes) as f64 / elapsed.as_secs_f64()) as u64;
                        self.bitrate.store(rate, Ordering::Relaxed);
                        window_start = Instant::now();
                        window_bytes = total;
                    }

                    if self.reached_live() {
                        self.publish(chunk).await;
                    } else if let Some(buffer) = prebuffer.as_mut() {
                        buffer.push(chunk);
                        if buffer.is_ready() {
                            let burst = buffer.flush();
                            prebuffer = None;
                            self.go_live(burst.len());
                            self.publish(burst).await;
                        }
                    } else {
                        // Pre-buffering disabled: live on the first chunk.
                        self.go_live(chunk.len());
                        self.publish(chunk).await;
                    }
                }
                Ok(None) => {
                    debug!(channel_id = self.channel_id, "Upstream body ended");
                    match self.handle_disruption(&mut first_byte, "upstream ended").await {
                        Some(next) => response = next,
                        None => break,
                    }
                }
                Err(StreamError::UpstreamCancelled) => break,
                Err(e) => {
                    warn!(channel_id = self.channel_id, "Upstream read failed: {e}");
                    if let Some(tx) = first_byte.take() {
                        // No byte ever arrived: let the caller fail over.
                        let _ = tx.send(Err(e));
                        break;
                    }
                    match self.handle_disruption(&mut first_byte, "upstream error").await {
                        Some(next) => response = next,
                        None => break,
                    }
                }
            }
        }

        self.destroy("pump finished").await;
    }

    /// Decide between reconnecting and dying after the upstream dropped.
    async fn handle_disruption(
        &self,
        first_byte: &mut Option<oneshot::Sender<Result<(), StreamError>>>,
        why: &str,
    ) -> Option<reqwest::Response> {
        if let Some(tx) = first_byte.take() {
            let _ = tx.send(Err(StreamError::UpstreamUnreachable {
                message: format!("{why} before first byte"),
            }));
            return None;
        }
        if self.cancel.is_cancelled() {
            return None;
        }
        self.reconnect().await
    }

    /// Reconnect loop: bounded by the cumulative budget, skipped entirely
    /// when no clients remain. A successful reconnect resumes the live
    /// flow; the pre-buffer is never refilled.
    async fn reconnect(&self) -> Option<reqwest::Response> {
        loop {
            if self.client_count().await == 0 {
                debug!(
                    channel_id = self.channel_id,
                    "No clients remain; skipping reconnect"
                );
                return None;
            }

            let spent = self.reconnects.load(Ordering::Relaxed);
            if spent >= self.settings.max_reconnects {
                warn!(
                    channel_id = self.channel_id,
                    attempts = spent,
                    "Reconnect budget exhausted"
                );
                return None;
            }
            let attempt = self.reconnects.fetch_add(1, Ordering::Relaxed) + 1;

            info!(
                channel_id = self.channel_id,
                attempt,
                max = self.settings.max_reconnects,
                "Reconnecting to upstream"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }

            match self.fetch_upstream().await {
                Ok(response) => {
                    info!(channel_id = self.channel_id, "Upstream reconnected");
                    return Some(response);
                }
                Err(e) => {
                    warn!(channel_id = self.channel_id, "Reconnect attempt failed: {e}");
                }
            }
        }
    }

    async fn fetch_upstream(&self) -> Result<reqwest::Response, StreamError> {
        let request = self
            .http
            .get(&self.upstream_url)
            .header(header::USER_AGENT, UPSTREAM_USER_AGENT)
            .header(header::CONNECTION, "keep-alive")
            .header(header::ACCEPT, "*/*");

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StreamError::UpstreamCancelled),
            result = request.send() => result.map_err(|e| StreamError::UpstreamUnreachable {
                message: e.to_string(),
            })?,
        };

        if !response.status().is_success() {
            return Err(StreamError::UpstreamStatus {
                status: response.status().as_u16(),
            });
        }

        Ok(response)
    }

    fn go_live(&self, first_bytes: usize) {
        self.reached_live.store(true, Ordering::SeqCst);
        info!(
            channel_id = self.channel_id,
            source_id = self.source_id,
            first_bytes,
            "Stream session live"
        );
    }

    /// Feed the rolling buffer and fan the chunk out. Holding the rolling
    /// lock across the broadcast send keeps attach snapshots consistent.
    async fn publish(&self, chunk: Bytes) {
        let receivers = self.clients.read().await.len() as u64;
        self.bytes_out
            .fetch_add(chunk.len() as u64 * receivers, Ordering::Relaxed);

        let mut rolling = self.rolling.lock().await;
        rolling.push(&chunk);
        let _ = self.chunk_tx.send(SessionEvent::Chunk(chunk));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::streaming::testutil::{
        spawn_upstream, test_history, test_settings, ts_payload, UpstreamBehavior,
    };

    struct Harness {
        session: Arc<StreamSession>,
        registry: Arc<SessionRegistry>,
        db: Database,
    }

    async fn make_session(
        url: &str,
        settings: SessionSettings,
        username: Option<&str>,
        is_vod: bool,
    ) -> Harness {
        let (db, history) = test_history().await;
        let registry = SessionRegistry::new();
        let params = SessionParams {
            channel_id: 42,
            channel_name: "Test Channel".to_string(),
            upstream_url: url.to_string(),
            source_id: 1,
            username: username.map(str::to_string),
            is_vod,
            settings,
            http: reqwest::Client::new(),
            history,
            registry: Arc::downgrade(&registry),
        };
        let (session, created) = registry
            .get_or_create(42, || StreamSession::new(params))
            .await;
        assert!(created);
        Harness {
            session,
            registry,
            db,
        }
    }

    fn split_chunks(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        payload.chunks(chunk_size).map(<[u8]>::to_vec).collect()
    }

    async fn collect_until_end(
        bridge: Bytes,
        mut receiver: broadcast::Receiver<SessionEvent>,
    ) -> Vec<u8> {
        let mut received = bridge.to_vec();
        loop {
            match tokio::time::timeout(Duration::from_secs(15), receiver.recv()).await {
                Ok(Ok(SessionEvent::Chunk(chunk))) => received.extend_from_slice(&chunk),
                Ok(Ok(SessionEvent::End)) => break,
                Ok(Err(_)) => break,
                Err(_) => panic!("timed out waiting for session end"),
            }
        }
        received
    }

    #[tokio::test]
    async fn start_surfaces_upstream_error_status() {
        let upstream = spawn_upstream(vec![UpstreamBehavior::error(502)]).await;
        let harness = make_session(&upstream.url, test_settings(0, 0), None, false).await;

        let err = harness
            .session
            .start(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::UpstreamStatus { status: 502 }));

        harness.session.destroy("start failed").await;
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn start_fails_on_unreachable_upstream() {
        // Nothing listens on this port.
        let harness = make_session(
            "http://127.0.0.1:9/never",
            test_settings(0, 0),
            None,
            false,
        )
        .await;

        let err = harness
            .session
            .start(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::UpstreamUnreachable { .. }));
    }

    #[tokio::test]
    async fn clients_share_one_upstream_and_see_identical_bytes() {
        let payload = ts_payload(40);
        let chunks = split_chunks(&payload, 4 * 188);
        let upstream = spawn_upstream(vec![UpstreamBehavior::serving(
            chunks,
            Duration::from_millis(60),
        )])
        .await;

        let harness = make_session(&upstream.url, test_settings(1, 0), None, false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();

        // Both clients attach during the pre-buffer fill; the flush must
        // hand them the same initial burst.
        let (_, bridge_a, rx_a) = harness.session.attach(ClientMeta::default()).await;
        let (_, bridge_b, rx_b) = harness.session.attach(ClientMeta::default()).await;
        assert!(bridge_a.is_empty());
        assert!(bridge_b.is_empty());
        assert_eq!(harness.session.client_count().await, 2);

        let received_a = collect_until_end(bridge_a, rx_a).await;
        let received_b = collect_until_end(bridge_b, rx_b).await;

        assert_eq!(received_a, received_b);
        assert_eq!(received_a, payload);
        assert_eq!(upstream.connection_count(), 1);
        assert!(harness.session.reached_live());
        assert_eq!(harness.session.bytes_in(), payload.len() as u64);
    }

    #[tokio::test]
    async fn prebuffer_disabled_goes_live_on_first_chunk() {
        let payload = ts_payload(20);
        let chunks = split_chunks(&payload, 2 * 188);
        let upstream = spawn_upstream(vec![UpstreamBehavior::serving(
            chunks,
            Duration::from_millis(50),
        )])
        .await;

        let harness = make_session(&upstream.url, test_settings(0, 0), None, false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();

        let (_, bridge, rx) = harness.session.attach(ClientMeta::default()).await;
        // Rolling buffer is disabled along with the pre-buffer.
        assert!(bridge.is_empty());

        let received = collect_until_end(bridge, rx).await;
        assert!(!received.is_empty());
        // The client may have missed chunks published before it attached,
        // but never sees anything out of order or duplicated.
        assert!(payload.ends_with(&received));
    }

    #[tokio::test]
    async fn late_joiner_receives_rolling_bridge() {
        let payload = ts_payload(60);
        let chunks = split_chunks(&payload, 2 * 188);
        let upstream = spawn_upstream(vec![UpstreamBehavior::serving(
            chunks,
            Duration::from_millis(50),
        )])
        .await;

        let harness = make_session(&upstream.url, test_settings(1, 0), None, false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();
        let (_, bridge_a, rx_a) = harness.session.attach(ClientMeta::default()).await;

        // Past the flush (~500ms) and well into live streaming.
        tokio::time::sleep(Duration::from_millis(900)).await;

        let (_, bridge_b, rx_b) = harness.session.attach(ClientMeta::default()).await;
        assert!(!bridge_b.is_empty());
        // The bridge starts at the keyframe-bearing packet.
        assert_eq!(bridge_b[0], 0x47);
        assert_ne!(bridge_b[1] & 0x40, 0);

        let received_a = collect_until_end(bridge_a, rx_a).await;
        let received_b = collect_until_end(bridge_b, rx_b).await;

        // The ring held everything since the keyframe, so the late joiner
        // converges on the exact same byte sequence.
        assert_eq!(received_a, received_b);
        assert_eq!(received_a, payload);
    }

    #[tokio::test]
    async fn live_session_dies_when_last_client_leaves() {
        let payload = ts_payload(200);
        let chunks = split_chunks(&payload, 188);
        let upstream = spawn_upstream(vec![UpstreamBehavior::serving(
            chunks,
            Duration::from_millis(50),
        )])
        .await;

        let harness = make_session(&upstream.url, test_settings(0, 5), None, false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();

        let (client_id, _, mut rx) = harness.session.attach(ClientMeta::default()).await;
        harness.session.detach(client_id).await;

        assert!(harness.session.is_dead());
        assert!(harness.registry.is_empty().await);

        // Straggling subscribers observe a clean end event.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("end event")
            {
                Ok(SessionEvent::End) => break,
                Ok(SessionEvent::Chunk(_)) => continue,
                Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn vod_session_lingers_for_grace_period() {
        let payload = ts_payload(400);
        let chunks = split_chunks(&payload, 188);
        let upstream = spawn_upstream(vec![UpstreamBehavior::serving(
            chunks,
            Duration::from_millis(20),
        )])
        .await;

        let harness = make_session(&upstream.url, test_settings(0, 5), None, true).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();

        let (client_id, _, _rx) = harness.session.attach(ClientMeta::default()).await;
        harness.session.detach(client_id).await;
        // Within the grace window the session is still alive.
        assert!(!harness.session.is_dead());

        // A quick rejoin keeps it alive past the window.
        let (client_id, _, _rx2) = harness.session.attach(ClientMeta::default()).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!harness.session.is_dead());

        // Leaving for good lets the grace timer fire.
        harness.session.detach(client_id).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(harness.session.is_dead());
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn history_written_for_authenticated_session() {
        let payload = ts_payload(10);
        let chunks = split_chunks(&payload, 188);
        let upstream = spawn_upstream(vec![UpstreamBehavior::serving(
            chunks,
            Duration::from_millis(10),
        )])
        .await;

        let harness =
            make_session(&upstream.url, test_settings(0, 0), Some("alice"), false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();

        let (_, bridge, rx) = harness.session.attach(ClientMeta::default()).await;
        let _ = collect_until_end(bridge, rx).await;

        // Destroy already ran; give the history write a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let rows = sqlx::query_as::<_, crate::models::StreamHistoryEntry>(
            "SELECT id, username, channel_id, started_at, ended_at, duration_s FROM stream_history",
        )
        .fetch_all(harness.db.pool())
        .await
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].username, "alice");
        assert_eq!(rows[0].channel_id, 42);
        assert!(rows[0].duration_s >= 0);
        assert!(rows[0].ended_at >= rows[0].started_at);
    }

    #[tokio::test]
    async fn no_history_for_session_that_never_went_live() {
        let upstream = spawn_upstream(vec![UpstreamBehavior::error(503)]).await;
        let harness =
            make_session(&upstream.url, test_settings(0, 0), Some("alice"), false).await;

        assert!(harness.session.start(Duration::from_secs(5)).await.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stream_history")
            .fetch_one(harness.db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn reconnects_resume_the_stream_until_budget_runs_out() {
        let payload = ts_payload(16);
        let (first_half, second_half) = payload.split_at(payload.len() / 2);
        let upstream = spawn_upstream(vec![
            UpstreamBehavior::serving(split_chunks(first_half, 188), Duration::from_millis(40)),
            UpstreamBehavior::serving(split_chunks(second_half, 188), Duration::from_millis(40)),
            UpstreamBehavior::error(404),
        ])
        .await;

        let harness = make_session(&upstream.url, test_settings(0, 3), None, false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();
        let (_, bridge, rx) = harness.session.attach(ClientMeta::default()).await;

        let received = collect_until_end(bridge, rx).await;

        // The client saw bytes from both connections, in order.
        assert!(payload.ends_with(&received));
        assert!(received.len() > second_half.len());
        // First reconnect succeeded; the rest burned the budget on 404s.
        assert_eq!(harness.session.reconnects(), 3);
        assert!(upstream.connection_count() >= 3);
        assert!(harness.session.is_dead());
    }

    #[tokio::test]
    async fn stalled_upstream_triggers_reconnect() {
        let chunk = ts_payload(2);
        let upstream = spawn_upstream(vec![
            // Writes one chunk, then sits silent far past the stall window.
            UpstreamBehavior::serving(
                vec![chunk.clone(), chunk.clone()],
                Duration::from_secs(30),
            ),
            UpstreamBehavior::error(404),
        ])
        .await;

        let settings = SessionSettings {
            pre_buffer_seconds: 0,
            max_reconnects: 1,
            reconnect_delay: Duration::from_millis(30),
            stall_timeout: Duration::from_millis(150),
            vod_grace: Duration::from_millis(100),
        };
        let harness = make_session(&upstream.url, settings, None, false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();
        let (_, bridge, rx) = harness.session.attach(ClientMeta::default()).await;

        let received = collect_until_end(bridge, rx).await;
        assert!(chunk.ends_with(&received) || received.is_empty() || received == chunk);
        assert!(harness.session.is_dead());
        assert!(upstream.connection_count() >= 2);
    }

    #[tokio::test]
    async fn external_destroy_cancels_the_pump() {
        let payload = ts_payload(400);
        let upstream = spawn_upstream(vec![UpstreamBehavior::serving(
            split_chunks(&payload, 188),
            Duration::from_millis(25),
        )])
        .await;

        let harness = make_session(&upstream.url, test_settings(0, 5), None, false).await;
        harness.session.start(Duration::from_secs(5)).await.unwrap();
        let (_, bridge, rx) = harness.session.attach(ClientMeta::default()).await;

        let session = harness.session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            session.destroy("terminated via api").await;
        });

        let _ = collect_until_end(bridge, rx).await;
        assert!(harness.session.is_dead());
        assert!(harness.registry.is_empty().await);
    }
}
