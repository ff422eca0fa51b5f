// src/server/mod.rs
//! HTTP front door
//!
//! `POST /sandbox/{language}` executes code and always answers HTTP 200
//! with an `ExecutionResult` body — errors travel in-band, not as status
//! codes. `GET /health` (liveness + pool stats) and `GET /metrics`
//! (Prometheus) are unauthenticated; everything under `/sandbox/`
//! requires the bearer token when one is configured.

use crate::executor::SandboxExecutor;
use crate::runtime::language::Language;
use crate::runtime::protocol::{ExecutionRequest, ExecutionResult};
use crate::utils::config::ServerConfig;
use crate::utils::errors::{Result, SandboxError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Largest request body the front door will buffer
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct ApiServer {
    executor: Arc<SandboxExecutor>,
    config: ServerConfig,
    metrics: Option<PrometheusHandle>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl ApiServer {
    pub fn new(
        executor: Arc<SandboxExecutor>,
        config: ServerConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            executor,
            config,
            metrics,
            started_at: chrono::Utc::now(),
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| SandboxError::Config(format!("invalid server address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener (tests bind port 0)
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "sandbox API listening");
        let server = Arc::new(self);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping API server");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let server = Arc::clone(&server);
                                    async move {
                                        Ok::<_, std::convert::Infallible>(
                                            server.handle(req).await,
                                        )
                                    }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return json_response(
                    StatusCode::OK,
                    &ExecutionResult::failure(format!("Invalid request body: {e}")),
                )
            }
        };
        self.route(parts.method, parts.uri.path(), &parts.headers, body)
            .await
    }

    /// Route one fully-buffered request
    pub async fn route(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<Full<Bytes>> {
        if method == Method::GET && path == "/health" {
            return self.health().await;
        }
        if method == Method::GET && path == "/metrics" {
            return self.metrics_page();
        }
        if method == Method::POST && path.starts_with("/sandbox/") {
            if !self.authorized(headers) {
                return json_response(
                    StatusCode::UNAUTHORIZED,
                    &json!({ "success": false, "message": "Unauthorized" }),
                );
            }
            let segment = &path["/sandbox/".len()..];
            let Some(language) = Language::from_route(segment) else {
                return json_response(
                    StatusCode::NOT_FOUND,
                    &json!({ "success": false, "message": format!("Unknown language '{segment}'") }),
                );
            };
            return self.execute(language, body).await;
        }
        json_response(
            StatusCode::NOT_FOUND,
            &json!({ "success": false, "message": "Not found" }),
        )
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(token) = &self.config.bearer_token else {
            return true;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {token}"))
            .unwrap_or(false)
    }

    async fn execute(&self, language: Language, body: Bytes) -> Response<Full<Bytes>> {
        if body.len() > MAX_BODY_BYTES {
            return json_response(
                StatusCode::OK,
                &ExecutionResult::failure("Request body too large"),
            );
        }
        let request: ExecutionRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return json_response(
                    StatusCode::OK,
                    &ExecutionResult::failure(format!("Invalid request body: {e}")),
                )
            }
        };
        let result = self.executor.execute(language, request).await;
        // Errors are reported in-band: HTTP 200 regardless of success
        json_response(StatusCode::OK, &result)
    }

    async fn health(&self) -> Response<Full<Bytes>> {
        let pools = self.executor.pool_stats().await;
        json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "version": crate::VERSION,
                "startedAt": self.started_at.to_rfc3339(),
                "pools": pools,
            }),
        )
    }

    fn metrics_page(&self) -> Response<Full<Bytes>> {
        match &self.metrics {
            Some(handle) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(handle.render())))
                .unwrap(),
            None => json_response(
                StatusCode::NOT_FOUND,
                &json!({ "success": false, "message": "Metrics disabled" }),
            ),
        }
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::EngineConfig;

    fn python_missing() -> bool {
        let missing = which::which("python3").is_err();
        if missing {
            eprintln!("python3 not found in PATH, skipping server test");
        }
        missing
    }

    fn poolless_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.pool.javascript_pool_size = 0;
        cfg.pool.python_pool_size = 0;
        cfg
    }

    fn server(bearer_token: Option<&str>) -> ApiServer {
        let cfg = poolless_config();
        let executor = Arc::new(SandboxExecutor::new(cfg.clone()).unwrap());
        let mut server_cfg = cfg.server;
        server_cfg.bearer_token = bearer_token.map(str::to_string);
        ApiServer::new(executor, server_cfg, None)
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_requires_no_auth() {
        let server = server(Some("sekret"));
        let response = server
            .route(Method::GET, "/health", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], crate::VERSION);
    }

    #[tokio::test]
    async fn test_sandbox_routes_require_bearer_token() {
        let server = server(Some("sekret"));

        let response = server
            .route(Method::POST, "/sandbox/python", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer wrong".parse().unwrap());
        let response = server
            .route(Method::POST, "/sandbox/python", &headers, Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_body_is_in_band_failure() {
        let server = server(None);
        let response = server
            .route(
                Method::POST,
                "/sandbox/python",
                &HeaderMap::new(),
                Bytes::from_static(b"not json"),
            )
            .await;
        // In-band error: still HTTP 200
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("Invalid request body"));
    }

    #[tokio::test]
    async fn test_unknown_language_and_route_404() {
        let server = server(None);
        let response = server
            .route(Method::POST, "/sandbox/ruby", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server
            .route(Method::GET, "/nope", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_execute_roundtrip_with_auth() {
        if python_missing() {
            return;
        }
        let server = server(Some("sekret"));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer sekret".parse().unwrap());
        let payload = serde_json::to_vec(&serde_json::json!({
            "code": "def main(variables):\n    return variables['a'] + variables['b']",
            "variables": { "a": 2, "b": 5 },
        }))
        .unwrap();
        let response = server
            .route(
                Method::POST,
                "/sandbox/python",
                &headers,
                Bytes::from(payload),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true, "{body}");
        assert_eq!(body["data"]["codeReturn"], 7);
    }

    #[tokio::test]
    async fn test_failure_results_still_http_200() {
        if python_missing() {
            return;
        }
        let server = server(None);
        let payload =
            serde_json::to_vec(&serde_json::json!({ "code": "import os\ndef main():\n    pass" }))
                .unwrap();
        let response = server
            .route(
                Method::POST,
                "/sandbox/python",
                &HeaderMap::new(),
                Bytes::from(payload),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("not allowed"));
    }
}
