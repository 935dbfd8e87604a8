//! Product installation onto deployed infrastructure.
//!
//! Every installable [`Product`] has exactly one [`Provisioner`] in the
//! [`ProvisionerRegistry`]. Provisioners may hand part of their work to
//! another product's provisioner through the registry; the delegation graph
//! is acyclic:
//!
//! ```text
//! kubeadm ──► kubernetes ──► docker
//! k3s, helm, logging, storage, rook, registry, traefik ──(inventory)──► kubeadm
//! mysql, services, traefik, kube-state-metrics ──(config)──► kubernetes
//! ```

mod base;
pub mod cluster;
pub mod executor;
mod ingress;
pub mod inventory;
mod kubernetes;
mod monitoring;
mod mysql;
mod platform;
mod registry;
mod services;
mod storage;
#[cfg(test)]
mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hyde_networking::NetworkError;
use hyde_reconcile::ReconcileError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::db::DbError;
use crate::model::{Infrastructure, Parameters};
use cluster::ClusterError;
use executor::ExecutorError;
use inventory::Inventory;

pub use base::{
    DockerProvisioner, HelmProvisioner, HostsProvisioner, LoggingProvisioner, RegistryProvisioner,
};
pub use ingress::{TraefikConfig, TraefikProvisioner};
pub use kubernetes::{K3sProvisioner, KubeadmProvisioner, KubernetesProvisioner};
pub use monitoring::KubeStateMetricsProvisioner;
pub use mysql::{DatabaseConfig, DatabaseInstance, MysqlProvisioner};
pub use platform::KubernetesConfig;
pub use registry::{ProvisionerRegistry, ProvisionerSettings};
pub use services::ServicesProvisioner;
pub use storage::{RookProvisioner, StorageProvisioner, StorageTopology};

/// Argument that, when `false`, skips the SSH readiness playbook.
pub const WAIT_FOR_SSH: &str = "ansible_wait_for_ssh_ready";

/// Infrastructure flag: docker is already present on every node.
pub const DOCKER_INSTALLED: &str = "ansible_docker_installed";

/// Infrastructure flag: nodes were cloned from an image with kubeadm baked in.
pub const KUBEADM_PREINSTALLED: &str = "kubeadm_preinstalled_image";

/// Infrastructure flag: the distributed file system client is installed.
pub const GLUSTERFS_CLIENT_INSTALLED: &str = "glusterfs_client_installed";

// =============================================================================
// Products
// =============================================================================

/// Closed set of installable products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Product {
    Hosts,
    Docker,
    Kubernetes,
    Kubeadm,
    K3s,
    Helm,
    Logging,
    Storage,
    Rook,
    Mysql,
    Services,
    Registry,
    Traefik,
    KubeStateMetrics,
}

impl Product {
    pub const ALL: [Product; 14] = [
        Self::Hosts,
        Self::Docker,
        Self::Kubernetes,
        Self::Kubeadm,
        Self::K3s,
        Self::Helm,
        Self::Logging,
        Self::Storage,
        Self::Rook,
        Self::Mysql,
        Self::Services,
        Self::Registry,
        Self::Traefik,
        Self::KubeStateMetrics,
    ];

    /// Name used in requests and as the key in `Infrastructure::products`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hosts => "hosts",
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
            Self::Kubeadm => "kubeadm",
            Self::K3s => "k3s",
            Self::Helm => "helm",
            Self::Logging => "logging",
            Self::Storage => "storage",
            Self::Rook => "rook",
            Self::Mysql => "mysql",
            Self::Services => "services",
            Self::Registry => "registry",
            Self::Traefik => "traefik",
            Self::KubeStateMetrics => "kube-state-metrics",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Product {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| ProvisionError::UnknownProduct(s.to_string()))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No product with this name.
    #[error("unknown product {0}")]
    UnknownProduct(String),

    /// Registry built without a provisioner for this product.
    #[error("no provisioner registered for {0}")]
    MissingProvisioner(Product),

    /// Registry built with two provisioners for this product.
    #[error("more than one provisioner registered for {0}")]
    DuplicateProvisioner(Product),

    /// A required argument was not supplied.
    #[error("{product}: missing argument {argument}")]
    MissingArgument {
        product: Product,
        argument: &'static str,
    },

    /// An argument could not be interpreted.
    #[error("{product}: invalid argument {argument}: {reason}")]
    InvalidArgument {
        product: Product,
        argument: &'static str,
        reason: String,
    },

    /// The infrastructure is not in a state this product can install on.
    #[error("{product}: {message}")]
    Precondition { product: Product, message: String },

    /// A stored product configuration could not be decoded or encoded.
    #[error("configuration of {product}: {source}")]
    Config {
        product: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError<ClusterError>),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("vault: {0}")]
    Vault(#[from] DbError),

    /// Inventory could not be written.
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A platform resource did not settle in time.
    #[error("timeout after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// A platform resource settled in the wrong state.
    #[error("{what} is {actual}, expected {expected}")]
    UnexpectedStatus {
        what: String,
        expected: &'static str,
        actual: String,
    },

    /// A named object of this product already exists.
    #[error("{product} {name} already exists")]
    AlreadyExists { product: Product, name: String },
}

impl ProvisionError {
    pub(crate) fn missing(product: Product, argument: &'static str) -> Self {
        Self::MissingArgument { product, argument }
    }

    pub(crate) fn precondition(product: Product, message: impl Into<String>) -> Self {
        Self::Precondition {
            product,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Reconcile(e) => e.is_timeout(),
            _ => false,
        }
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Installs one product onto an infrastructure.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn product(&self) -> Product;

    /// Whether installs need the nodes reachable over SSH first.
    fn requires_ssh(&self, _args: &Parameters) -> bool {
        true
    }

    /// Whether a second install on the same infrastructure is refused.
    /// Products that create named instances check for their own duplicates.
    fn installs_once(&self, _args: &Parameters) -> bool {
        true
    }

    fn build_inventory(
        &self,
        registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        args: &Parameters,
    ) -> Result<Inventory, ProvisionError>;

    /// Installs the product. May record configuration into
    /// `infra.products`; never persists.
    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        infra: &mut Infrastructure,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError>;
}

/// Typed view of one untyped product configuration blob.
pub trait ProductConfig: Serialize + DeserializeOwned {
    const KEY: &'static str;

    /// `Ok(None)` when nothing is stored under [`Self::KEY`].
    fn load(blobs: &BTreeMap<String, Value>) -> Result<Option<Self>, ProvisionError> {
        blobs
            .get(Self::KEY)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|source| ProvisionError::Config {
                    product: Self::KEY.to_string(),
                    source,
                })
            })
            .transpose()
    }

    fn store(&self, blobs: &mut BTreeMap<String, Value>) -> Result<(), ProvisionError> {
        let value = serde_json::to_value(self).map_err(|source| ProvisionError::Config {
            product: Self::KEY.to_string(),
            source,
        })?;
        blobs.insert(Self::KEY.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde::Deserialize;
    use serde_json::json;

    #[rstest]
    #[case("kubeadm", Product::Kubeadm)]
    #[case("k3s", Product::K3s)]
    #[case("storage", Product::Storage)]
    #[case("services", Product::Services)]
    #[case("traefik", Product::Traefik)]
    #[case("kube-state-metrics", Product::KubeStateMetrics)]
    fn test_product_names(#[case] name: &str, #[case] product: Product) {
        assert_eq!(name.parse::<Product>().unwrap(), product);
        assert_eq!(product.to_string(), name);
    }

    #[test]
    fn test_unknown_product() {
        let err = "kafka".parse::<Product>().unwrap_err();
        assert_eq!(err.to_string(), "unknown product kafka");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    impl ProductConfig for Counter {
        const KEY: &'static str = "counter";
    }

    #[test]
    fn test_product_config_load_and_store() {
        let mut blobs = BTreeMap::new();
        assert!(Counter::load(&blobs).unwrap().is_none());

        Counter { count: 2 }.store(&mut blobs).unwrap();
        assert_eq!(blobs["counter"], json!({"count": 2}));
        assert_eq!(Counter::load(&blobs).unwrap(), Some(Counter { count: 2 }));
    }

    #[test]
    fn test_undecodable_config_is_error() {
        let blobs = BTreeMap::from([("counter".to_string(), json!({"count": "many"}))]);
        let err = Counter::load(&blobs).unwrap_err();
        assert!(matches!(err, ProvisionError::Config { product, .. } if product == "counter"));
    }
}
