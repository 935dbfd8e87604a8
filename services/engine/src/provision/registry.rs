use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hyde_networking::PortRange;
use hyde_reconcile::{PollConfig, Reconciler, DEFAULT_DELETION_TIMEOUT};
use tracing::{error, info, instrument};

use super::cluster::{ClusterClient, ClusterConnector};
use super::executor::{ExtraVars, PlaybookExecutor};
use super::inventory::Inventory;
use super::{
    DockerProvisioner, HelmProvisioner, HostsProvisioner, K3sProvisioner,
    KubeStateMetricsProvisioner, KubeadmProvisioner, KubernetesConfig, KubernetesProvisioner,
    LoggingProvisioner, MysqlProvisioner, Product, ProvisionError, Provisioner,
    RegistryProvisioner, RookProvisioner, ServicesProvisioner, StorageProvisioner,
    TraefikProvisioner, WAIT_FOR_SSH,
};
use crate::model::{Infrastructure, Parameters};
use crate::secrets::Vault;

const WAIT_FOR_SSH_PLAYBOOK: &str = "common/wait_for_ssh.yml";

/// Deadline for a storage cluster to report ready.
pub const DEFAULT_STORAGE_CLUSTER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Filesystem locations and timing shared by every provisioner.
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Root of the playbook tree.
    pub scripts_folder: PathBuf,
    /// Root under which per-infrastructure inventories and kubeconfigs live.
    pub inventory_folder: PathBuf,
    /// Range for ports allocated to platform services.
    pub port_range: PortRange,
    /// Wait for a replaced platform resource to disappear.
    pub deletion: PollConfig,
    /// Wait for a storage cluster to become ready.
    pub storage_cluster: PollConfig,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            scripts_folder: PathBuf::from("provision/ansible"),
            inventory_folder: PathBuf::from("/tmp/ansible_inventories"),
            port_range: PortRange::default(),
            deletion: PollConfig::with_timeout(DEFAULT_DELETION_TIMEOUT),
            storage_cluster: PollConfig::with_timeout(DEFAULT_STORAGE_CLUSTER_TIMEOUT),
        }
    }
}

/// One provisioner per product.
pub fn standard_provisioners() -> Vec<Box<dyn Provisioner>> {
    vec![
        Box::new(HostsProvisioner),
        Box::new(DockerProvisioner),
        Box::new(KubernetesProvisioner),
        Box::new(KubeadmProvisioner),
        Box::new(K3sProvisioner),
        Box::new(HelmProvisioner),
        Box::new(LoggingProvisioner),
        Box::new(StorageProvisioner),
        Box::new(RookProvisioner),
        Box::new(MysqlProvisioner),
        Box::new(ServicesProvisioner),
        Box::new(RegistryProvisioner),
        Box::new(TraefikProvisioner),
        Box::new(KubeStateMetricsProvisioner),
    ]
}

/// Product table plus the collaborators provisioners share.
pub struct ProvisionerRegistry {
    provisioners: BTreeMap<Product, Box<dyn Provisioner>>,
    executor: Arc<dyn PlaybookExecutor>,
    cluster: Arc<dyn ClusterConnector>,
    vault: Arc<dyn Vault>,
    reconciler: Reconciler,
    settings: ProvisionerSettings,
}

impl ProvisionerRegistry {
    /// Registry with the standard provisioner set.
    pub fn new(
        settings: ProvisionerSettings,
        executor: Arc<dyn PlaybookExecutor>,
        cluster: Arc<dyn ClusterConnector>,
        vault: Arc<dyn Vault>,
    ) -> Result<Self, ProvisionError> {
        Self::with_provisioners(standard_provisioners(), settings, executor, cluster, vault)
    }

    /// Fails unless every [`Product`] is registered exactly once.
    pub fn with_provisioners(
        provisioners: Vec<Box<dyn Provisioner>>,
        settings: ProvisionerSettings,
        executor: Arc<dyn PlaybookExecutor>,
        cluster: Arc<dyn ClusterConnector>,
        vault: Arc<dyn Vault>,
    ) -> Result<Self, ProvisionError> {
        let mut table = BTreeMap::new();
        for provisioner in provisioners {
            let product = provisioner.product();
            if table.insert(product, provisioner).is_some() {
                return Err(ProvisionError::DuplicateProvisioner(product));
            }
        }
        if let Some(missing) = Product::ALL.into_iter().find(|p| !table.contains_key(p)) {
            return Err(ProvisionError::MissingProvisioner(missing));
        }

        Ok(Self {
            provisioners: table,
            executor,
            cluster,
            vault,
            reconciler: Reconciler::new(settings.deletion),
            settings,
        })
    }

    pub fn get(&self, product: Product) -> Result<&dyn Provisioner, ProvisionError> {
        self.provisioners
            .get(&product)
            .map(AsRef::as_ref)
            .ok_or(ProvisionError::MissingProvisioner(product))
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    pub fn vault(&self) -> &dyn Vault {
        self.vault.as_ref()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// `{inventory_folder}/{infra_id}`; also where the kubeconfig lands.
    pub fn inventory_folder(&self, infra: &Infrastructure) -> PathBuf {
        self.settings.inventory_folder.join(infra.id.to_string())
    }

    pub fn inventory_path(&self, infra: &Infrastructure, product: Product) -> PathBuf {
        self.inventory_folder(infra)
            .join(product.name())
            .join("inventory")
    }

    pub fn playbook(&self, relative: &str) -> PathBuf {
        self.settings.scripts_folder.join(relative)
    }

    pub async fn run_playbook(
        &self,
        relative: &str,
        inventory: Option<&Path>,
        vars: &ExtraVars,
    ) -> Result<(), ProvisionError> {
        self.executor
            .run(&self.playbook(relative), inventory, vars)
            .await?;
        Ok(())
    }

    /// Inventory another product would install with.
    pub fn build_inventory(
        &self,
        product: Product,
        infra: &Infrastructure,
        args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        self.get(product)?.build_inventory(self, infra, args)
    }

    /// Client for the cluster the configuration points at.
    pub async fn cluster(
        &self,
        config: &KubernetesConfig,
    ) -> Result<Arc<dyn ClusterClient>, ProvisionError> {
        Ok(self.cluster.connect(Path::new(&config.config_file)).await?)
    }

    /// Installs `product` on `infra`.
    ///
    /// Writes the product's inventory, waits for SSH unless told otherwise,
    /// then hands over to the provisioner.
    #[instrument(skip(self, infra, args), fields(infrastructure = %infra.id, product = %product))]
    pub async fn provision(
        &self,
        infra: &mut Infrastructure,
        product: Product,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        let provisioner = self.get(product)?;

        let inventory = provisioner.build_inventory(self, infra, args)?;
        let path = self.inventory_path(infra, product);
        inventory
            .write(&path)
            .await
            .map_err(|source| ProvisionError::Io {
                path: path.clone(),
                source,
            })?;
        info!(inventory = %path.display(), hosts = inventory.hosts.len(), "Inventory written");

        if provisioner.requires_ssh(args) && args.get_bool_or(WAIT_FOR_SSH, true) {
            info!("Waiting for nodes to accept SSH");
            self.run_playbook(WAIT_FOR_SSH_PLAYBOOK, Some(&path), &ExtraVars::new())
                .await?;
        }

        match provisioner.deploy_product(self, &path, infra, args).await {
            Ok(result) => {
                info!("Product installed");
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "Error installing product");
                Err(e)
            }
        }
    }
}
