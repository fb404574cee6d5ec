//! Web layer
//!
//! Thin handlers over the stream gateway. Stream bodies are chunked
//! `video/mp2t` responses fed by broadcast subscriptions; everything else
//! is small JSON. Handlers map `StreamError` kinds onto the documented
//! status codes and never leak upstream details beyond an explanatory body.

use anyhow::Result;
use axum::{
    routing::{delete, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::{
    config::Config,
    repositories::{CatalogRepository, UserRepository},
    streaming::StreamGateway,
};

pub mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub catalog: CatalogRepository,
    pub users: UserRepository,
    pub gateway: Arc<StreamGateway>,
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        let app = Self::create_router(state);

        Ok(Self { app, addr })
    }

    /// Router over the gateway's public surface. Public so tests can drive
    /// it without binding a socket.
    pub fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handlers::health::health_check))
            // Proxy stream endpoints
            .route("/stream/:channel_id", get(handlers::streams::proxy_stream))
            .route(
                "/xtream/:username/:password/:channel_id",
                get(handlers::streams::xtream_stream),
            )
            .route(
                "/movie/:username/:password/:channel_id",
                get(handlers::vod::movie_stream),
            )
            .route(
                "/series/:username/:password/:channel_id",
                get(handlers::vod::series_stream),
            )
            // Session administration
            .route("/api/streams", get(handlers::streams::list_streams))
            .route(
                "/api/streams/:channel_id",
                delete(handlers::streams::kill_stream),
            )
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Start the web server
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }
}
