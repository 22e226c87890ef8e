//! Policy Engine Control Plane Library
//!
//! HTTP front end for the policy engine:
//!
//! - **Run requests**: submit workflows, poll their status, cancel them
//! - **Task backends**: execute in-process or dispatch to the worker pool
//!   over NATS JetStream
//! - **Webhook ingress**: run a sender's workflow on GitHub push and pull
//!   request events and report the outcome as a check run or commit status
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`backend`]: The [`backend::TaskBackend`] trait and its implementations
//! - [`github`]: Check-run and commit-status reporting
//! - [`services`]: Webhook handling
//! - [`handlers`]: HTTP route handlers
//! - [`error`]: Custom error types with Axum integration
//! - [`state`]: Shared application state
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use policy_engine::Runner;
//! use policy_engine_control_plane::{backend::InProcessBackend, build_router, config::AppConfig, state::AppState};
//!
//! let config = Arc::new(AppConfig::default());
//! let backend = Arc::new(InProcessBackend::new(Runner::new(config.engine_config())));
//! let app = build_router(AppState::new(config, backend));
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod github;
pub mod handlers;
pub mod result_ext;
pub mod services;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;

use state::AppState;

/// Build the application router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health))
        .route(
            "/request/create",
            post(handlers::request::create).put(handlers::request::create),
        )
        .route("/request/status/{id}", get(handlers::request::status))
        .route("/request/cancel/{id}", post(handlers::request::cancel))
        .route("/webhook/github", post(handlers::webhook::github))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use policy_engine::Runner;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::backend::InProcessBackend;
    use crate::config::AppConfig;
    use crate::state::AppState;

    fn app() -> Router {
        let config = Arc::new(AppConfig::default());
        let backend = Arc::new(InProcessBackend::new(Runner::new(config.engine_config())));
        build_router(AppState::new(config, backend))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_routes() {
        let app = app();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "in_process");
        assert_eq!(body["webhooks"], false);
    }

    #[tokio::test]
    async fn test_submit_and_poll_until_complete() {
        let app = app();
        let workflow = "on: push\njobs:\n  test:\n    steps:\n      - id: hello\n        run: echo \"hello=world\" >> \"$GITHUB_OUTPUT\"\n";

        let (status, body) = send(
            &app,
            json_request("POST", "/request/create", json!({"inputs": {}, "workflow": workflow})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "submitted");
        let id = body["detail"]["id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());

        let mut last = Value::Null;
        for _ in 0..200 {
            let (status, body) = send(&app, get(&format!("/request/status/{id}"))).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == "complete" {
                last = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(last["detail"]["id"], id.as_str());
        assert_eq!(last["detail"]["exit_status"], "success");
        assert_eq!(last["detail"]["outputs"]["test"]["hello"]["hello"], "world");
    }

    #[tokio::test]
    async fn test_put_is_accepted_with_structured_workflow() {
        let app = app();
        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/request/create",
                json!({"workflow": {"on": "push", "jobs": {}}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "submitted");
    }

    #[tokio::test]
    async fn test_invalid_step_is_input_validation_error() {
        let app = app();
        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/request/create",
                json!({"workflow": {"jobs": {"j": {"steps": [{"name": "nothing"}]}}}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "input_validation_error");
        assert_eq!(body["detail"][0]["loc"][0], "body");
    }

    #[tokio::test]
    async fn test_malformed_json_is_input_validation_error() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/request/create")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "input_validation_error");
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let app = app();
        let (status, body) = send(&app, get("/request/status/nope")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "unknown", "detail": {"id": "nope"}}));

        let (_, body) = send(&app, json_request("POST", "/request/cancel/nope", json!({}))).await;
        assert_eq!(body["status"], "unknown");
    }

    #[tokio::test]
    async fn test_webhook_ping_and_unsupported_events() {
        let app = app();
        let mut request = json_request("POST", "/webhook/github", json!({"zen": "hi"}));
        request.headers_mut().insert("X-GitHub-Event", "ping".parse().unwrap());
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pong");

        let mut request = json_request("POST", "/webhook/github", json!({"action": "closed"}));
        request.headers_mut().insert("X-GitHub-Event", "pull_request".parse().unwrap());
        let (_, body) = send(&app, request).await;
        assert_eq!(body["status"], "ignored");

        let request = json_request("POST", "/webhook/github", json!({}));
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
