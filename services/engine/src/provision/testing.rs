//! Shared fixtures for provisioner tests.

use std::sync::Arc;
use std::time::Duration;

use hyde_id::SecretId;
use hyde_networking::PortRange;
use hyde_reconcile::PollConfig;
use tempfile::TempDir;

use super::cluster::MemoryCluster;
use super::executor::RecordingExecutor;
use super::registry::standard_provisioners;
use super::{ProvisionError, Provisioner, ProvisionerRegistry, ProvisionerSettings};
use crate::db::MemoryVault;
use crate::model::{
    DriveInfo, Infrastructure, InfrastructureSpec, Node, Parameters, ProviderInfo, ProviderRef,
};

pub struct Harness {
    pub registry: ProvisionerRegistry,
    pub executor: Arc<RecordingExecutor>,
    pub cluster: Arc<MemoryCluster>,
    pub vault: Arc<MemoryVault>,
    settings: ProvisionerSettings,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(RecordingExecutor::new(), MemoryCluster::new())
    }

    pub fn failing_playbooks<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(RecordingExecutor::failing_for(suffixes), MemoryCluster::new())
    }

    pub fn with_cluster(cluster: MemoryCluster) -> Self {
        Self::build(RecordingExecutor::new(), cluster)
    }

    fn build(executor: RecordingExecutor, cluster: MemoryCluster) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = ProvisionerSettings {
            scripts_folder: dir.path().join("scripts"),
            inventory_folder: dir.path().join("inventories"),
            port_range: PortRange::new(30000, 30009).unwrap(),
            deletion: PollConfig::new(Duration::from_secs(1), Duration::from_secs(10)),
            storage_cluster: PollConfig::new(Duration::from_secs(3), Duration::from_secs(30)),
        };
        let executor = Arc::new(executor);
        let cluster = Arc::new(cluster);
        let vault = Arc::new(MemoryVault::new());

        let registry = ProvisionerRegistry::with_provisioners(
            standard_provisioners(),
            settings.clone(),
            executor.clone(),
            Arc::new(cluster.clone()),
            vault.clone(),
        )
        .unwrap();

        Self {
            registry,
            executor,
            cluster,
            vault,
            settings,
            _dir: dir,
        }
    }

    pub fn registry_with(
        &self,
        provisioners: Vec<Box<dyn Provisioner>>,
    ) -> Result<ProvisionerRegistry, ProvisionError> {
        ProvisionerRegistry::with_provisioners(
            provisioners,
            self.settings.clone(),
            self.executor.clone(),
            Arc::new(self.cluster.clone()),
            self.vault.clone(),
        )
    }

    /// Playbooks run so far, relative to the scripts folder.
    pub async fn playbooks(&self) -> Vec<String> {
        self.executor.playbooks(&self.settings.scripts_folder).await
    }

    /// Infrastructure `site` with one data drive per node.
    pub fn infrastructure(&self, masters: usize, slaves: usize) -> Infrastructure {
        let spec = InfrastructureSpec {
            name: "site".into(),
            description: None,
            kind: "cloud".into(),
            provider: ProviderInfo {
                api_endpoint: String::new(),
                api_type: "stub".into(),
                secret_id: None,
                credentials: Default::default(),
            },
            resources: vec![],
            extra_properties: Parameters::new(),
        };
        let mut infra = Infrastructure::new(
            &spec,
            ProviderRef {
                api_endpoint: String::new(),
                api_type: "stub".into(),
                secret_id: SecretId::new(),
            },
        );

        let roles = std::iter::repeat("master")
            .take(masters)
            .chain(std::iter::repeat("slave").take(slaves));
        for (i, role) in roles.enumerate() {
            infra.add_node(Node {
                hostname: format!("site-{role}{i}"),
                role: role.into(),
                ip: format!("10.0.0.{}", i + 2),
                username: "cloudsigma".into(),
                uuid: Some(format!("server-{i}")),
                drive_uuid: Some(format!("boot-{i}")),
                data_drives: vec![DriveInfo {
                    uuid: format!("data-{i}"),
                    name: "data1".into(),
                    size: 10240,
                }],
                cpu: 2000,
                ram: 2048,
                cores: 1,
            });
        }
        infra
    }
}
