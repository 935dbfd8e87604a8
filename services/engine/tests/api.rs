//! HTTP API against a live server on the in-memory stores and the dev-mode
//! stub provider.

use std::time::Duration;

use hyde_engine::api;
use hyde_engine::controller::DeploymentController;
use hyde_engine::db::Stores;
use hyde_engine::orchestrator::InfrastructureOrchestrator;
use hyde_engine::provider::{DefaultProviderResolver, ProviderTimeouts};
use hyde_engine::provision::cluster::MemoryCluster;
use hyde_engine::provision::executor::RecordingExecutor;
use hyde_engine::provision::{ProvisionerRegistry, ProvisionerSettings};
use hyde_engine::state::AppState;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct ApiHarness {
    base_url: String,
    client: reqwest::Client,
    _dir: TempDir,
}

impl ApiHarness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::memory();

        let resolver = DefaultProviderResolver::new(
            stores.vault.clone(),
            ProviderTimeouts::default(),
            "cloudsigma",
            true,
        );
        let settings = ProvisionerSettings {
            scripts_folder: dir.path().join("scripts"),
            inventory_folder: dir.path().join("inventories"),
            ..ProvisionerSettings::default()
        };
        let registry = ProvisionerRegistry::new(
            settings,
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
        let app = api::create_router(AppState::new(controller, stores));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn deployment_body() -> Value {
    let resource = |name: &str, role: &str| {
        json!({
            "name": name,
            "role": role,
            "image_id": "ubuntu-22.04",
            "cpu": 2000,
            "ram": 4096,
            "drives": [{"name": "data1", "type": "SSD", "size": 10240}]
        })
    };
    json!({
        "name": "hybrid",
        "infrastructures": [{
            "name": "site",
            "type": "cloud",
            "provider": {
                "api_endpoint": "http://stub.invalid/api/2.0",
                "api_type": "stub",
                "credentials": {"username": "ops", "password": "secret"}
            },
            "resources": [
                resource("master", "master"),
                resource("slave1", "slave"),
                resource("slave2", "slave")
            ]
        }]
    })
}

#[tokio::test]
async fn test_deployment_lifecycle() {
    let h = ApiHarness::new().await;

    let resp = h
        .client
        .post(h.url("/deployment"))
        .json(&deployment_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["status"], "running");
    assert!(created["infrastructures"][0]["provider"]["secret_id"]
        .as_str()
        .unwrap()
        .starts_with("sec_"));
    assert!(created["infrastructures"][0]["provider"]
        .get("credentials")
        .is_none());

    let dep_id = created["id"].as_str().unwrap().to_string();
    let infra_id = created["infrastructures"][0]["id"].as_str().unwrap().to_string();

    let resp = h
        .client
        .put(h.url(&format!("/deployment/{dep_id}/{infra_id}/logging")))
        .query(&[("ansible_wait_for_ssh_ready", "false")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("kubernetes is not installed"));

    let resp = h
        .client
        .put(h.url(&format!("/deployment/{dep_id}/{infra_id}/hosts")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let provisioned: Value = resp.json().await.unwrap();
    assert!(provisioned["infrastructures"][0]["products"]
        .get("hosts")
        .is_some());

    let resp = h
        .client
        .put(h.url(&format!("/deployment/{dep_id}/{infra_id}/hosts")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("already present"));

    let resp = h
        .client
        .get(h.url(&format!("/deployment/{dep_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let fetched: Value = resp.json().await.unwrap();
    assert_eq!(fetched, provisioned);

    let resp = h
        .client
        .delete(h.url(&format!("/deployment/{dep_id}/{infra_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = h.client.get(h.url("/deployment")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let listed: Vec<Value> = resp.json().await.unwrap();
    assert!(listed.is_empty());

    let resp = h
        .client
        .get(h.url(&format!("/deployment/{dep_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let h = ApiHarness::new().await;

    let resp = h
        .client
        .post(h.url("/deployment"))
        .header("content-type", "application/json")
        .body(r#"{"name": "hybrid""#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_invalid_request_is_internal_error() {
    let h = ApiHarness::new().await;
    let mut body = deployment_body();
    body["infrastructures"] = json!([]);

    let resp = h
        .client
        .post(h.url("/deployment"))
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("no infrastructures"));
}

#[tokio::test]
async fn test_unsupported_provider_fails_deployment() {
    let h = ApiHarness::new().await;
    let mut body = deployment_body();
    body["infrastructures"][0]["provider"]["api_type"] = json!("openstack");

    let resp = h
        .client
        .post(h.url("/deployment"))
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("unsupported provider type"));
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = ApiHarness::new().await;

    for path in ["/healthz", "/readyz", "/livez"] {
        let resp = h.client.get(h.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
    }

    let body: Value = h
        .client
        .get(h.url("/readyz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["components"]["store"]["status"], "ok");
}
