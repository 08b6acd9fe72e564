//! REST reference server, gated behind the `http-server` feature.
//!
//! Grounded in `src/llm/mcp_http_adapter.rs`'s `AxumHttpAdapter`: an `axum`
//! `Router` built from extractor-based handlers returning `(StatusCode, Json<..>)`.
//! Exposes the orchestrator's `process` pipeline over HTTP plus health and
//! Prometheus metrics endpoints, mirroring `mcp_server_gateway/api/app.py`'s
//! `/process`, `/health`, `/metrics` surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::orchestrator::controller::Orchestrator;

/// Build the router with no authentication. Callers own binding/serving so
/// they can layer their own TLS termination, tracing middleware, or graceful
/// shutdown signal.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/v1/query", post(handle_query))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(orchestrator)
}

/// Build the router with an optional bearer token toggle, the same shape as
/// `MCPServerBuilder::with_bearer_token`: when `bearer_token` is `Some`,
/// every request must carry `Authorization: Bearer <token>` matching it.
/// Tokens are compared as SHA-256 digests under `subtle::ConstantTimeEq`
/// rather than with `==`, so a mismatching request can't be timed to learn
/// how many leading bytes it got right.
pub fn router_with_auth(orchestrator: Arc<Orchestrator>, bearer_token: Option<String>) -> Router {
    let app = router(orchestrator);
    match bearer_token {
        Some(token) => {
            let expected: Arc<Vec<u8>> = Arc::new(Sha256::digest(token.as_bytes()).to_vec());
            app.layer(middleware::from_fn(move |req: Request, next: Next| {
                let expected = expected.clone();
                async move { bearer_auth(expected, req, next).await }
            }))
        }
        None => app,
    }
}

async fn bearer_auth(expected: Arc<Vec<u8>>, req: Request, next: Next) -> axum::response::Response {
    let authorized = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| {
            let provided = Sha256::digest(token.as_bytes()).to_vec();
            bool::from(expected.as_slice().ct_eq(provided.as_slice()))
        })
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

/// Bind and serve `router_with_auth(orchestrator, bearer_token)` at `addr`
/// until the process is killed. A thin convenience wrapper; production
/// deployments typically call [`router`]/[`router_with_auth`] directly and
/// compose their own `tower` middleware stack.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    addr: SocketAddr,
    bearer_token: Option<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router_with_auth(orchestrator, bearer_token);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_query(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let result = orchestrator.process(payload).await;
    let status = if result.get("status").and_then(|v| v.as_str()) == Some("error") {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    };
    (status, Json(result))
}

async fn handle_health(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let healthy = orchestrator.registry().health_check_all().await;
    let all_healthy = healthy.values().all(|&v| v);
    let status = if all_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(serde_json::json!({"agents": healthy, "healthy": all_healthy})))
}

async fn handle_metrics(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    (StatusCode::OK, orchestrator.metrics().render_prometheus_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::agent::{Agent, AgentRegistry, AgentResponse};
    use crate::orchestrator::config::{AgentsFileConfig, OrchestratorConfig, RulesFileConfig};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::error::Error;
    use tower::ServiceExt;

    struct EchoAgent;
    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
        async fn call(
            &self,
            _input: serde_json::Value,
            _timeout: Option<std::time::Duration>,
        ) -> Result<AgentResponse, Box<dyn Error + Send + Sync>> {
            Ok(AgentResponse::success("echo", serde_json::json!({"ok": true}), 0.001))
        }
    }

    async fn test_orchestrator() -> Arc<Orchestrator> {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(EchoAgent), true).await.unwrap();
        Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            AgentsFileConfig { agents: vec![] },
            RulesFileConfig { rules: vec![] },
            registry,
            None,
            None,
            None,
        ))
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = router(test_orchestrator().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let app = router(test_orchestrator().await);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_bearer_token_configured_allows_all_requests() {
        let app = router_with_auth(test_orchestrator().await, None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_bearer_token_is_rejected() {
        let app = router_with_auth(test_orchestrator().await, Some("secret".to_string()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_bearer_token_is_rejected() {
        let app = router_with_auth(test_orchestrator().await, Some("secret".to_string()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("Authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_bearer_token_is_accepted() {
        let app = router_with_auth(test_orchestrator().await, Some("secret".to_string()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("Authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
