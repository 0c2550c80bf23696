//! HTTP surface: router, global headers and the article handlers
//!
//! URL prefixes bind to NNTP verbs: `/m/` (buffered article with byte
//! ranges), `/d/` (raw dot-encoded article, streamed), `/h/` (headers only).
//! Everything else falls through to the embedded static assets.

pub mod handlers;
pub mod range;

use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::pool::BufferPool;

/// Shared state for the article handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub buffers: BufferPool,
    pub article_size_limit: usize,
    pub default_newsgroup: String,
}

/// Build the full application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/m/{*name}",
            get(handlers::message_get).post(handlers::message_post),
        )
        .route(
            "/d/{*name}",
            get(handlers::raw_get).post(handlers::raw_post),
        )
        .route("/h/{*name}", get(handlers::head_get))
        .fallback(crate::assets::serve)
        .layer(middleware::from_fn(global_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Response headers applied to everything the gateway serves
async fn global_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=2592000"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
