use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::path::{Component, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Package index directory served over HTTP on an ephemeral port.
#[derive(Debug)]
pub struct IndexServer {
    pub url: String,
    handle: JoinHandle<()>,
}

impl Drop for IndexServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
struct IndexState {
    root: Arc<PathBuf>,
}

async fn serve_artifact(
    State(state): State<IndexState>,
    Path(path): Path<String>,
) -> impl IntoResponse {
    let relative = PathBuf::from(path.trim_start_matches('/'));
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return (StatusCode::BAD_REQUEST, Vec::new()).into_response();
    }

    match tokio::fs::read(state.root.join(relative)).await {
        Ok(body) => ([(header::CONTENT_TYPE, "application/gzip")], body).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, b"not found".to_vec()).into_response(),
    }
}

pub fn index_router(root: PathBuf) -> Router {
    Router::new()
        .route("/*path", get(serve_artifact))
        .with_state(IndexState {
            root: Arc::new(root),
        })
}

pub async fn spawn_index_server(root: PathBuf) -> Result<IndexServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}", listener.local_addr()?);
    let app = index_router(root);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("fixture index server stopped: {e}");
        }
    });

    Ok(IndexServer { url, handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_decoded_paths_and_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("my pkg")).unwrap();
        std::fs::write(dir.path().join("my pkg/1.0.0.tar.gz"), b"archive").unwrap();
        let server = spawn_index_server(dir.path().to_path_buf()).await.unwrap();

        let ok = reqwest::get(format!("{}/my%20pkg/1.0.0.tar.gz", server.url))
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);
        assert_eq!(ok.bytes().await.unwrap().as_ref(), b"archive");

        let missing = reqwest::get(format!("{}/other/1.0.0.tar.gz", server.url))
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let escape = reqwest::get(format!("{}/my%20pkg/..%2F..%2Fsecret", server.url))
            .await
            .unwrap();
        assert!(!escape.status().is_success());
    }
}
