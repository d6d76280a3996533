//! HTTP surface.
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /i/{*path}` | [`Resolver::fetch`] on a blocking worker |
//! | `GET /health` | JSON status and cache counters |
//!
//! Resolution does blocking file I/O and may wait on another request's
//! transcode, so each image request runs under `spawn_blocking`. A client that
//! disconnects drops only the response future; the blocking task runs to
//! completion and still populates the cache.

use crate::imaging::Transcoder;
use crate::resolver::{CACHE_CONTROL, CONTENT_TYPE, ResolveError, Resolver, parse_path};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use std::time::Instant;
use tokio::task;

/// Body of every 5xx image response.
pub const PROCESSING_FAILED: &str = "image processing failed";

pub fn router<B: Transcoder + 'static>(resolver: Arc<Resolver<B>>) -> Router {
    Router::new()
        .route("/i/{*path}", get(image::<B>))
        .route("/health", get(health::<B>))
        .with_state(resolver)
}

/// Bind `listen` and serve until Ctrl-C.
pub async fn serve(listen: &str, app: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
}

async fn image<B: Transcoder + 'static>(
    State(resolver): State<Arc<Resolver<B>>>,
    Path(path): Path<String>,
) -> Response {
    let (slug, token) = match parse_path(&path) {
        Ok(parsed) => parsed,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let start = Instant::now();
    let worker = {
        let slug = slug.clone();
        let token = token.clone();
        task::spawn_blocking(move || resolver.fetch(&slug, &token))
    };
    let fetched = match worker.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(slug = %slug, token, error = %e, "image worker failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, PROCESSING_FAILED).into_response();
        }
    };

    match fetched {
        Ok(fetched) => {
            tracing::debug!(
                slug = %slug,
                token,
                bytes = fetched.bytes.len(),
                cache = fetched.outcome.map(|o| o.as_str()).unwrap_or("static"),
                dur_ms = start.elapsed().as_millis() as u64,
                "served"
            );
            let mut resp = Response::new(fetched.bytes.into());
            let headers = resp.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
            resp
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &ResolveError) -> Response {
    match StatusCode::from_u16(err.status_code()) {
        Ok(StatusCode::NOT_FOUND) => StatusCode::NOT_FOUND.into_response(),
        Ok(status) => (status, PROCESSING_FAILED).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, PROCESSING_FAILED).into_response(),
    }
}

async fn health<B: Transcoder + 'static>(
    State(resolver): State<Arc<Resolver<B>>>,
) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "cache": resolver.coordinator().stats().snapshot(),
    }))
}
