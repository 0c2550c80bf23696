//! Embedded static assets for the browser UI
//!
//! Everything outside the article prefixes is served from the embedded
//! `static/` tree. Misses from a browser (an `Accept` header mentioning
//! `text/html`) fall back to `index.html` so client-side routes resolve;
//! everything else gets a plain 404.

use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "static/"]
struct StaticAssets;

/// Fallback handler for everything outside `/m/`, `/d/` and `/h/`
pub async fn serve(request: Request) -> Response {
    let path = request.uri().path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    if let Some(content) = StaticAssets::get(path) {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        return (
            [(header::CONTENT_TYPE, mime.to_string())],
            content.data.into_owned(),
        )
            .into_response();
    }

    let accepts_html = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));
    if accepts_html {
        if let Some(index) = StaticAssets::get("index.html") {
            return (
                [(header::CONTENT_TYPE, "text/html; charset=utf-8".to_string())],
                index.data.into_owned(),
            )
                .into_response();
        }
    }

    (StatusCode::NOT_FOUND, "404 not found").into_response()
}
