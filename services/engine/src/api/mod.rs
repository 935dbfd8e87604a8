//! HTTP API handlers and routing.

pub mod error;
mod deployments;
mod health;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .merge(deployments::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::controller::DeploymentController;
    use crate::db::Stores;
    use crate::orchestrator::InfrastructureOrchestrator;
    use crate::provider::{DefaultProviderResolver, ProviderTimeouts};
    use crate::provision::cluster::MemoryCluster;
    use crate::provision::executor::RecordingExecutor;
    use crate::provision::{ProvisionerRegistry, ProvisionerSettings};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    fn make_app_state() -> AppState {
        let stores = Stores::memory();
        let resolver = DefaultProviderResolver::new(
            stores.vault.clone(),
            ProviderTimeouts::default(),
            "cloudsigma",
            true,
        );
        let registry = ProvisionerRegistry::new(
            ProvisionerSettings::default(),
            Arc::new(RecordingExecutor::new()),
            Arc::new(Arc::new(MemoryCluster::new())),
            stores.vault.clone(),
        )
        .unwrap();
        let controller = DeploymentController::new(
            stores.repository.clone(),
            stores.vault.clone(),
            InfrastructureOrchestrator::new(Arc::new(resolver)),
            registry,
        );
        AppState::new(controller, stores)
    }

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let response = create_router(make_app_state())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_readyz_checks_store() {
        let (status, body) = send(Request::get("/readyz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["components"]["store"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_malformed_id_is_bad_request() {
        let (status, body) =
            send(Request::get("/deployment/not-an-id").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_missing_deployment_is_internal_error() {
        let id = hyde_id::DeploymentId::new();
        let (status, body) = send(
            Request::get(format!("/deployment/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_bad_request() {
        let (status, _) = send(
            Request::post("/deployment")
                .body(Body::from(r#"{"name": "x"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_list() {
        let (status, body) = send(Request::get("/deployment").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(vec![]));
    }
}
