//! VOD and series endpoints
//!
//! Without a `Range` header these behave like credentialed live streams,
//! except the emptied session lingers for the grace window (players often
//! reopen a VOD connection immediately). With a `Range` header session
//! sharing is disabled entirely: each request gets its own upstream fetch
//! with the range and the relevant upstream headers forwarded verbatim.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Response, StatusCode},
};
use futures::TryStreamExt;

use crate::{auth, errors::StreamError, streaming::session::UPSTREAM_USER_AGENT};

use super::super::AppState;
use super::streams::{
    error_response, parse_channel_id, serve_channel, stream_error_response,
};

pub async fn movie_stream(
    Path((username, password, channel_id)): Path<(String, String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response<Body> {
    vod_stream(state, username, password, channel_id, headers).await
}

pub async fn series_stream(
    Path((username, password, channel_id)): Path<(String, String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response<Body> {
    vod_stream(state, username, password, channel_id, headers).await
}

async fn vod_stream(
    state: AppState,
    username: String,
    password: String,
    channel_id: String,
    headers: HeaderMap,
) -> Response<Body> {
    let Some(channel_id) = parse_channel_id(&channel_id) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown channel");
    };

    let user = match auth::authenticate(&state.users, &username, &password).await {
        Ok(user) => user,
        Err(e) => return stream_error_response(&e),
    };

    if headers.contains_key(header::RANGE) {
        range_passthrough(&state, channel_id, &headers).await
    } else {
        serve_channel(&state, channel_id, Some(user), &headers, true).await
    }
}

/// Dedicated upstream fetch for a range request. No session, no buffers:
/// the upstream's status and range-related headers pass straight through.
async fn range_passthrough(
    state: &AppState,
    channel_id: i64,
    headers: &HeaderMap,
) -> Response<Body> {
    let channel = match state.catalog.lookup_playlist_channel(channel_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return stream_error_response(&StreamError::ChannelNotFound(channel_id)),
        Err(e) => {
            return stream_error_response(&StreamError::Internal {
                message: e.to_string(),
            })
        }
    };

    // reqwest still speaks http 0.2 types; convert via raw bytes.
    let mut request = state
        .gateway
        .http()
        .get(&channel.url)
        .header(reqwest::header::USER_AGENT, UPSTREAM_USER_AGENT)
        .header(reqwest::header::ACCEPT, "*/*");
    if let Some(range) = headers.get(header::RANGE) {
        request = request.header(reqwest::header::RANGE, range.as_bytes());
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return stream_error_response(&StreamError::UpstreamUnreachable {
                message: e.to_string(),
            })
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::ACCEPT_RANGES,
        header::CONTENT_RANGE,
    ] {
        if let Some(value) = upstream.headers().get(name.as_str()) {
            builder = builder.header(name, value.as_bytes());
        }
    }

    let body_stream = upstream
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response")
        })
}
