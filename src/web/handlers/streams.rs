//! Live stream endpoints
//!
//! `/stream/{id}` proxies a channel with optional query credentials;
//! `/xtream/{user}/{pass}/{id}` is the credentialed equivalent. Both share
//! one serving path: authenticate, open through the gateway, then feed the
//! response from the bridge plus the live subscription. The `/api/streams`
//! pair exposes and terminates live sessions.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Response, StatusCode},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    auth,
    errors::StreamError,
    models::{ActiveStreamInfo, User},
    streaming::{session::ClientMeta, SessionEvent, StreamHandle},
};

use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

pub async fn proxy_stream(
    Path(channel_id): Path<String>,
    Query(credentials): Query<StreamCredentials>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response<Body> {
    let Some(channel_id) = parse_channel_id(&channel_id) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown channel");
    };

    let user = match (credentials.username, credentials.password) {
        (Some(username), Some(password)) => {
            match auth::authenticate(&state.users, &username, &password).await {
                Ok(user) => Some(user),
                Err(e) => return stream_error_response(&e),
            }
        }
        (None, None) => None,
        _ => return stream_error_response(&StreamError::UserInvalid),
    };

    serve_channel(&state, channel_id, user, &headers, false).await
}

pub async fn xtream_stream(
    Path((username, password, channel_id)): Path<(String, String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response<Body> {
    let Some(channel_id) = parse_channel_id(&channel_id) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown channel");
    };

    let user = match auth::authenticate(&state.users, &username, &password).await {
        Ok(user) => user,
        Err(e) => return stream_error_response(&e),
    };

    serve_channel(&state, channel_id, Some(user), &headers, false).await
}

pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<ActiveStreamInfo>> {
    Json(state.gateway.active_streams().await)
}

pub async fn kill_stream(
    Path(channel_id): Path<i64>,
    State(state): State<AppState>,
) -> StatusCode {
    if state.gateway.kill_session(channel_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Shared serving path for live and shared-session VOD requests.
pub(super) async fn serve_channel(
    state: &AppState,
    channel_id: i64,
    user: Option<User>,
    headers: &HeaderMap,
    is_vod: bool,
) -> Response<Body> {
    let meta = client_meta(headers);

    match state
        .gateway
        .open_stream(channel_id, user.as_ref(), meta, is_vod)
        .await
    {
        Ok(handle) => stream_response(handle),
        Err(e) => stream_error_response(&e),
    }
}

/// Stream id segments may carry a container extension (`123.ts`).
pub(super) fn parse_channel_id(raw: &str) -> Option<i64> {
    let digits = raw.split('.').next().unwrap_or(raw);
    digits.parse().ok()
}

pub(super) fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ClientMeta { ip, user_agent }
}

/// Turn an attached handle into a chunked MPEG-TS response: the rolling
/// bridge first (empty for a fresh session), then live chunks until the
/// session ends or this client falls too far behind and is evicted.
fn stream_response(handle: StreamHandle) -> Response<Body> {
    let StreamHandle {
        session,
        bridge,
        mut receiver,
        guard,
    } = handle;

    let channel_id = session.channel_id;
    let body_stream = async_stream::stream! {
        let _guard = guard;

        if !bridge.is_empty() {
            yield Ok::<Bytes, std::io::Error>(bridge);
        }

        loop {
            match receiver.recv().await {
                Ok(SessionEvent::Chunk(chunk)) => yield Ok(chunk),
                Ok(SessionEvent::End) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(channel_id, skipped, "Evicting slow stream client");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response")
        })
}

pub(super) fn stream_error_response(error: &StreamError) -> Response<Body> {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match error {
        StreamError::AllVariantsFailed { attempts } => {
            format!("All upstream sources failed for this channel ({attempts} attempted)")
        }
        other => other.to_string(),
    };
    error_response(status, &body)
}

pub(super) fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("internal error"))
                .unwrap()
        })
}
