//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hyde_engine::controller::DeploymentController;
use hyde_engine::db::Stores;
use hyde_engine::model::{
    DeploymentRequest, DriveSpec, InfrastructureSpec, Parameters, ProviderInfo, ProviderRef,
    ResourceSpec,
};
use hyde_engine::orchestrator::InfrastructureOrchestrator;
use hyde_engine::provider::{ProviderAdapter, ProviderError, ProviderResolver};
use hyde_engine::provision::cluster::MemoryCluster;
use hyde_engine::provision::executor::RecordingExecutor;
use hyde_engine::provision::{ProvisionerRegistry, ProvisionerSettings};
use tempfile::TempDir;

/// Resolves every provider reference to the same adapter.
pub struct FixedResolver(pub Arc<dyn ProviderAdapter>);

#[async_trait]
impl ProviderResolver for FixedResolver {
    async fn resolve(
        &self,
        _provider: &ProviderRef,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        Ok(self.0.clone())
    }
}

/// In-memory stores plus recording collaborators.
pub struct TestEngine {
    pub stores: Stores,
    pub executor: Arc<RecordingExecutor>,
    pub cluster: Arc<MemoryCluster>,
    pub dir: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,hyde_engine=debug".into()),
            )
            .with_test_writer()
            .try_init();

        Self {
            stores: Stores::memory(),
            executor: Arc::new(RecordingExecutor::new()),
            cluster: Arc::new(MemoryCluster::new()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            scripts_folder: self.dir.path().join("scripts"),
            inventory_folder: self.dir.path().join("inventories"),
            ..ProvisionerSettings::default()
        }
    }

    pub fn controller_with(&self, resolver: Arc<dyn ProviderResolver>) -> DeploymentController {
        let registry = ProvisionerRegistry::new(
            self.settings(),
            self.executor.clone(),
            Arc::new(self.cluster.clone()),
            self.stores.vault.clone(),
        )
        .unwrap();
        DeploymentController::new(
            self.stores.repository.clone(),
            self.stores.vault.clone(),
            InfrastructureOrchestrator::new(resolver),
            registry,
        )
    }

    pub fn controller(&self, provider: Arc<dyn ProviderAdapter>) -> DeploymentController {
        self.controller_with(Arc::new(FixedResolver(provider)))
    }

    /// Recorded playbooks relative to the scripts folder.
    pub async fn playbooks(&self) -> Vec<String> {
        self.executor.playbooks(&self.settings().scripts_folder).await
    }
}

pub fn resource(name: &str, role: &str) -> ResourceSpec {
    ResourceSpec {
        name: name.into(),
        instance_type: None,
        cpu: 2000,
        cores: 2,
        ram: 4096,
        disk: 20480,
        role: role.into(),
        image_id: "ubuntu-22.04".into(),
        ip: None,
        drives: vec![DriveSpec {
            name: "data1".into(),
            kind: "SSD".into(),
            size: 10240,
        }],
        extra_properties: Parameters::new(),
    }
}

/// One master and `slaves` slaves on a `stub` provider.
pub fn infrastructure(name: &str, slaves: usize) -> InfrastructureSpec {
    let mut resources = vec![resource("master", "master")];
    resources.extend((1..=slaves).map(|i| resource(&format!("slave{i}"), "slave")));

    InfrastructureSpec {
        name: name.into(),
        description: None,
        kind: "cloud".into(),
        provider: ProviderInfo {
            api_endpoint: "http://stub.invalid/api/2.0".into(),
            api_type: "stub".into(),
            secret_id: None,
            credentials: BTreeMap::from([
                ("username".to_string(), "ops@example.com".to_string()),
                ("password".to_string(), "secret".to_string()),
            ]),
        },
        resources,
        extra_properties: Parameters::new(),
    }
}

pub fn request(infrastructures: Vec<InfrastructureSpec>) -> DeploymentRequest {
    DeploymentRequest {
        name: "hybrid".into(),
        description: None,
        infrastructures,
    }
}
