//! Serves files from a directory with range support.
//!
//! ```sh
//! RUST_LOG=axum_byteranges=debug cargo run --example serve -- ./test
//! curl -H 'Range: bytes=0-4,12-15' http://localhost:3000/fixture.txt
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::header::ETAG;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing_subscriber::EnvFilter;

use axum_byteranges::{FileResource, Ranged};

struct Root(PathBuf);

impl Root {
    /// Resolve a request path below the root, refusing anything that would
    /// climb out of it.
    fn resolve(&self, requested: &str) -> Option<PathBuf> {
        let relative = Path::new(requested);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.0.join(relative))
    }
}

async fn get_file(
    State(root): State<Arc<Root>>,
    UrlPath(requested): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let Some(path) = root.resolve(&requested) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let file = match FileResource::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "cannot open file");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let etag = file.etag().and_then(|tag| HeaderValue::try_from(tag).ok());
    let mut response = Ranged::file(headers, file).into_response();
    if let Some(etag) = etag {
        response.headers_mut().insert(ETAG, etag);
    }
    response
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let root = std::env::args().nth(1).unwrap_or_else(|| "test".to_string());
    tracing::info!(root = %root, "serving files");

    let router = Router::new()
        .route("/{*path}", get(get_file))
        .with_state(Arc::new(Root(PathBuf::from(root))));

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    axum::serve(listener, router).await.unwrap();
}
