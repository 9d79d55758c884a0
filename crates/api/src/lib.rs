//! The HTTP application: routing, request context construction, and
//! the JSON rendering of rows and errors.
//!
//! One wildcard route serves the whole data surface; the path shape
//! decides whether a request addresses a model, a row, a subresource
//! or an operation like `:changes` and `:wipe`. Renderers beyond JSON
//! and token issuance are external collaborators.

pub mod context;

mod error;
mod handlers;

pub use context::{Grant, NoAuth, ScopeSource, SharedSink, StaticScopes};
pub use error::ApiError;

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use backends::{PostgresStore, SqlSource};
use keymap::KeyMap;
use manifest::Manifest;

pub struct AppState {
    pub manifest: Arc<Manifest>,
    pub store: Arc<PostgresStore>,
    /// External SQL sources, keyed by the backend name resources bind.
    pub sources: HashMap<String, SqlSource>,
    pub keymap: Arc<KeyMap>,
    pub scope_source: Arc<dyn ScopeSource>,
    pub sink: SharedSink,
    pub accesslog_buffer: usize,
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/version", get(handlers::version))
        .route("/robots.txt", get(handlers::robots))
        .route("/favicon.ico", get(handlers::favicon))
        .route(
            "/*path",
            get(handlers::get_any)
                .post(handlers::post_any)
                .put(handlers::put_any)
                .patch(handlers::patch_any)
                .delete(handlers::delete_any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the application until shutdown.
pub async fn serve(state: Arc<AppState>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
