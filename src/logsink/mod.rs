#![forbid(unsafe_code)]

// Log sink - HTTP service collecting progress lines into one file per session

use axum::{
    extract::State,
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Service settings read from the environment.
#[derive(Debug, Clone)]
pub struct LogSinkConfig {
    pub addr: SocketAddr,
    pub log_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 4443)),
            log_dir: PathBuf::from("logs"),
            static_dir: PathBuf::from("static"),
        }
    }
}

impl LogSinkConfig {
    /// Reads `LOG_SERVER_ADDR`, `LOG_DIR` and `STATIC_DIR`, keeping defaults for unset values.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("LOG_SERVER_ADDR") {
            config.addr = addr
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid LOG_SERVER_ADDR: {addr}"))?;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("STATIC_DIR") {
            config.static_dir = PathBuf::from(dir);
        }
        Ok(config)
    }
}

#[derive(Deserialize)]
struct LogRequest {
    session: Option<String>,
    message: Option<String>,
}

/// Session ids double as file names, so only the 32-digit hex form is accepted.
fn valid_session(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Clone)]
pub struct LogSink {
    log_dir: Arc<PathBuf>,
    static_dir: Arc<PathBuf>,
}

impl LogSink {
    pub fn new(config: &LogSinkConfig) -> Self {
        Self {
            log_dir: Arc::new(config.log_dir.clone()),
            static_dir: Arc::new(config.static_dir.clone()),
        }
    }

    async fn append(&self, session: &str, text: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.log_dir.as_path()).await?;
        let path = self.log_dir.join(format!("{session}.txt"));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }

    pub fn router(self) -> Router {
        let static_files = ServeDir::new(self.static_dir.as_path());
        Router::new()
            .route("/", get(index_handler))
            .route("/session", get(session_handler))
            .route("/log", post(log_handler))
            .with_state(self)
            .nest_service("/static", static_files)
            .layer(CorsLayer::permissive())
    }

    /// Serves on an already bound listener until the task is cancelled.
    pub async fn serve_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Log sink listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener).await
    }
}

async fn index_handler() -> Redirect {
    Redirect::to("/static/index.html")
}

async fn session_handler(State(sink): State<LogSink>, headers: HeaderMap) -> Response {
    let session = Uuid::new_v4().simple().to_string();
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let banner = format!("[New session with ID {session} and user-agent: \"{user_agent}\"]\n");

    match sink.append(&session, &banner).await {
        Ok(()) => {
            info!("New log session {}", session);
            session.into_response()
        }
        Err(e) => {
            error!("Failed to open log for session {}: {}", session, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn log_handler(State(sink): State<LogSink>, Json(request): Json<LogRequest>) -> StatusCode {
    let (Some(session), Some(message)) = (request.session, request.message) else {
        return StatusCode::BAD_REQUEST;
    };
    if !valid_session(&session) {
        return StatusCode::BAD_REQUEST;
    }

    match sink.append(&session, &message).await {
        Ok(()) => {
            debug!("Appended {} bytes to session {}", message.len(), session);
            StatusCode::OK
        }
        Err(e) => {
            error!("Failed to append to session {}: {}", session, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::path::Path;
    use tower::ServiceExt;

    fn sink(dir: &Path) -> LogSink {
        LogSink::new(&LogSinkConfig {
            log_dir: dir.join("logs"),
            static_dir: dir.join("static"),
            ..Default::default()
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_log(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/log")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_session_validation() {
        assert!(valid_session("0123456789abcdef0123456789ABCDEF"));
        assert!(!valid_session("../../etc/passwd"));
        assert!(!valid_session("0123456789abcdef"));
    }

    #[tokio::test]
    async fn test_session_then_log() {
        let dir = tempfile::tempdir().unwrap();
        let app = sink(dir.path()).router();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/session")
                    .header(USER_AGENT, "peerlimit-test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session = body_text(response).await;
        assert!(valid_session(&session));

        let body = serde_json::json!({ "session": session, "message": "Success\n" });
        let response = app.oneshot(post_log(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let log = std::fs::read_to_string(dir.path().join("logs").join(format!("{session}.txt"))).unwrap();
        assert_eq!(
            log,
            format!("[New session with ID {session} and user-agent: \"peerlimit-test\"]\nSuccess\n")
        );
    }

    #[tokio::test]
    async fn test_log_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let app = sink(dir.path()).router();

        let response = app
            .clone()
            .oneshot(post_log(serde_json::json!({ "message": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_log(serde_json::json!({ "session": "nope", "message": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_root_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let response = sink(dir.path())
            .router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        assert_eq!(response.headers()[header::LOCATION], "/static/index.html");
    }
}
