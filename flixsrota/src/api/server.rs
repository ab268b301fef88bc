//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::ApiConfig;
use crate::logging::LogHandle;
use crate::queue::JobStore;
use crate::worker::JobProcessor;
use crate::{Error, Result};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub store: Arc<dyn JobStore>,
    /// Dispatcher; cancel requests go through it so running jobs are signalled.
    pub processor: Option<Arc<JobProcessor>>,
    pub log_handle: Option<Arc<LogHandle>>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            start_time: Instant::now(),
            store,
            processor: None,
            log_handle: None,
        }
    }

    pub fn with_processor(mut self, processor: Arc<JobProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_log_handle(mut self, handle: Arc<LogHandle>) -> Self {
        self.log_handle = Some(handle);
        self
    }
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Cancelling this token shuts the server down gracefully.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Health checks are polled frequently; keep them out of the request log.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if req.uri().path().starts_with("/api/health") {
                        Span::none()
                    } else {
                        use tower_http::trace::MakeSpan;
                        tower_http::trace::DefaultMakeSpan::new()
                            .level(tracing::Level::INFO)
                            .make_span(req)
                    }
                })
                .on_request(|req: &Request, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    use tower_http::trace::OnRequest;
                    tower_http::trace::DefaultOnRequest::new()
                        .level(tracing::Level::INFO)
                        .on_request(req, span);
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                        if span.is_disabled() {
                            return;
                        }
                        use tower_http::trace::OnResponse;
                        tower_http::trace::DefaultOnResponse::new()
                            .level(tracing::Level::INFO)
                            .on_response(res, latency, span);
                    },
                ),
        )
    }

    /// Serve until the cancel token fires.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid API address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Other(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await
            .map_err(|e| Error::Other(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Job, MemoryJobStore};
    use axum::body::Body;
    use axum::http::{Method, Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    fn server() -> (ApiServer, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let state = AppState::new(store.clone());
        (ApiServer::new(ApiConfig::default(), state), store)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_get_job() {
        let (server, _store) = server();
        let router = server.build_router();

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"input_path":"in.mp4","output_path":"out","ffmpeg_args":"-preset fast","priority":7}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "queued");
        let id = created["id"].as_str().unwrap().to_string();

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/api/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = body_json(response).await;
        assert_eq!(job["priority"], 7);
        assert_eq!(job["ffmpeg_args"], serde_json::json!(["-preset", "fast"]));
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let (server, _store) = server();
        let response = server
            .build_router()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/jobs/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let (server, _store) = server();
        let response = server
            .build_router()
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"input_path":" ","output_path":"out"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_cancel() {
        let (server, store) = server();
        let router = server.build_router();
        let a = store.enqueue(Job::new("a", "a")).await.unwrap();
        store.enqueue(Job::new("b", "b")).await.unwrap();

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri(format!("/api/jobs/{a}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "cancelled");

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/jobs?status=queued&limit=500")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let page = body_json(response).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["limit"], 100);
        assert_eq!(page["items"][0]["input_path"], "b");

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/jobs?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_queue_depth() {
        let (server, store) = server();
        store.enqueue(Job::new("a", "a")).await.unwrap();

        let response = server
            .build_router()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health = body_json(response).await;
        assert_eq!(health["queue_depth"], 1);
        assert_eq!(health["workers"]["total"], 0);
    }

    #[tokio::test]
    async fn test_logging_without_handle_is_unavailable() {
        let (server, _store) = server();
        let response = server
            .build_router()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/logging")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
