//! Storage layers: a distributed file system on the nodes' data drives, and
//! a storage-cluster operator running inside kubernetes.

use std::path::Path;

use async_trait::async_trait;
use hyde_reconcile::{wait_for_status_change, PollError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use super::cluster::{ClusterError, ResourceKind};
use super::executor::ExtraVars;
use super::inventory::Inventory;
use super::platform::require_kubernetes;
use super::{
    Product, ProductConfig, ProvisionError, Provisioner, ProvisionerRegistry,
    GLUSTERFS_CLIENT_INSTALLED,
};
use crate::model::{Infrastructure, Node, Parameters};

/// Below this many nodes the file system runs without replication.
const MIN_REPLICATED_NODES: usize = 3;

// =============================================================================
// Distributed file system
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTopology {
    pub clusters: Vec<StorageCluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCluster {
    pub nodes: Vec<StorageNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub node: StorageNodeInfo,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeInfo {
    pub hostnames: StorageHostnames,
    pub zone: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHostnames {
    pub manage: Vec<String>,
    pub storage: Vec<String>,
}

impl ProductConfig for StorageTopology {
    const KEY: &'static str = "storage";
}

impl StorageTopology {
    /// One cluster with every node in zone 1. Data drives map to `/dev/vdb`,
    /// `/dev/vdc`, ... in attachment order.
    pub fn for_infrastructure(infra: &Infrastructure) -> Self {
        let nodes = infra
            .all_nodes()
            .map(|node| StorageNode {
                node: StorageNodeInfo {
                    hostnames: StorageHostnames {
                        manage: vec![node.hostname.clone()],
                        storage: vec![node.ip.clone()],
                    },
                    zone: 1,
                },
                devices: (0..node.data_drives.len()).map(device_name).collect(),
            })
            .collect();
        Self {
            clusters: vec![StorageCluster { nodes }],
        }
    }
}

/// Virtio name of the `index`th data drive. The boot drive is `vda`; after
/// `vdz` the suffix grows a letter (`vdaa`, `vdab`, ...).
fn device_name(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    loop {
        letters.push(char::from(b'a' + (n % 26) as u8));
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    let suffix: String = letters.into_iter().rev().collect();
    format!("/dev/vd{suffix}")
}

pub struct StorageProvisioner;

#[async_trait]
impl Provisioner for StorageProvisioner {
    fn product(&self) -> Product {
        Product::Storage
    }

    fn build_inventory(
        &self,
        registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        registry.build_inventory(Product::Kubeadm, infra, args)
    }

    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        infra: &mut Infrastructure,
        _args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        let topology = StorageTopology::for_infrastructure(infra);
        let encoded =
            serde_json::to_string(&topology).map_err(|source| ProvisionError::Config {
                product: StorageTopology::KEY.to_string(),
                source,
            })?;

        let single_node = if infra.node_count() < MIN_REPLICATED_NODES {
            "--single-node"
        } else {
            ""
        };
        let install_client = !infra.extra_properties.get_bool(GLUSTERFS_CLIENT_INSTALLED);

        let vars = ExtraVars::from([
            ("topology".to_string(), Value::from(encoded)),
            ("single_node".to_string(), Value::from(single_node)),
            (
                "install_client".to_string(),
                Value::from(install_client.to_string()),
            ),
        ]);
        registry
            .run_playbook(
                "kubernetes/glusterfs/deploy_glusterfs.yml",
                Some(inventory),
                &vars,
            )
            .await?;

        topology.store(&mut infra.products)?;
        Ok(Parameters::new())
    }
}

// =============================================================================
// Storage-cluster operator
// =============================================================================

const CEPH_NAMESPACE: &str = "rook-ceph";
const CEPH_CLUSTER: &str = "rook-ceph";
const CLUSTER_CREATING: &str = "Creating";
const CLUSTER_CREATED: &str = "Created";

/// Smallest data drive the operator accepts, in MB.
const MIN_DRIVE_SIZE: u64 = 5 * 1024;

pub struct RookProvisioner;

impl RookProvisioner {
    /// Usable capacity in MB; every data drive must be large enough.
    fn capacity(&self, infra: &Infrastructure) -> Result<u64, ProvisionError> {
        let mut capacity = 0;
        for node in infra.all_nodes() {
            capacity += self.node_capacity(node)?;
        }
        if capacity == 0 {
            return Err(ProvisionError::precondition(
                self.product(),
                "no data drives attached to any node; at least one unformatted drive of 5GB is needed",
            ));
        }
        Ok(capacity)
    }

    fn node_capacity(&self, node: &Node) -> Result<u64, ProvisionError> {
        node.data_drives.iter().try_fold(0, |total, drive| {
            if drive.size < MIN_DRIVE_SIZE {
                return Err(ProvisionError::precondition(
                    self.product(),
                    format!(
                        "data drive {} of host {} is smaller than 5GB",
                        drive.uuid, node.hostname
                    ),
                ));
            }
            Ok(total + drive.size)
        })
    }

    #[instrument(skip_all)]
    async fn wait_for_cluster(
        &self,
        registry: &ProvisionerRegistry,
        infra: &Infrastructure,
    ) -> Result<(), ProvisionError> {
        let config = require_kubernetes(self.product(), infra)?;
        let client = registry.cluster(&config).await?;
        let client = client.as_ref();

        info!("Waiting for storage cluster to be ready");
        let status = wait_for_status_change(
            &CLUSTER_CREATING.to_string(),
            &registry.settings().storage_cluster,
            move || async move {
                let cluster = client
                    .get(ResourceKind::CephCluster, CEPH_NAMESPACE, CEPH_CLUSTER)
                    .await?;
                Ok::<_, ClusterError>(
                    cluster
                        .as_ref()
                        .and_then(|c| c.pointer("/status/state"))
                        .and_then(Value::as_str)
                        .filter(|state| !state.is_empty())
                        .unwrap_or(CLUSTER_CREATING)
                        .to_string(),
                )
            },
        )
        .await;

        match status {
            Ok(state) if state == CLUSTER_CREATED => {
                info!("Storage cluster ready");
                Ok(())
            }
            Ok(state) => Err(ProvisionError::UnexpectedStatus {
                what: format!("storage cluster {CEPH_CLUSTER}"),
                expected: CLUSTER_CREATED,
                actual: state,
            }),
            Err(PollError::Timeout { elapsed, .. }) => Err(ProvisionError::Timeout {
                what: format!("storage cluster {CEPH_CLUSTER}"),
                elapsed,
            }),
            Err(PollError::Remote(e)) => Err(ProvisionError::Cluster(e)),
        }
    }
}

#[async_trait]
impl Provisioner for RookProvisioner {
    fn product(&self) -> Product {
        Product::Rook
    }

    fn build_inventory(
        &self,
        registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        registry.build_inventory(Product::Kubeadm, infra, args)
    }

    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        infra: &mut Infrastructure,
        _args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        require_kubernetes(self.product(), infra)?;
        let capacity = self.capacity(infra)?;

        let slaves = infra.all_nodes().filter(|n| !n.is_master()).count();
        let ha = slaves > 1;
        let num_mons = if ha { 3 } else { 1 };
        info!(capacity_mb = capacity, ha, num_mons, "Deploying storage operator");

        let vars = ExtraVars::from([
            ("ha".to_string(), Value::from(ha)),
            ("num_mons".to_string(), Value::from(num_mons)),
        ]);
        registry
            .run_playbook("kubernetes/rook/deploy_rook.yml", Some(inventory), &vars)
            .await?;

        self.wait_for_cluster(registry, infra).await?;
        Ok(Parameters::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DriveInfo;
    use crate::provision::cluster::MemoryCluster;
    use crate::provision::testing::Harness;
    use crate::provision::KubernetesConfig;
    use serde_json::json;

    #[test]
    fn test_device_names_past_z_stay_unique() {
        assert_eq!(device_name(0), "/dev/vdb");
        assert_eq!(device_name(24), "/dev/vdz");
        assert_eq!(device_name(25), "/dev/vdaa");
        assert_eq!(device_name(26), "/dev/vdab");

        let names: std::collections::BTreeSet<String> = (0..800).map(device_name).collect();
        assert_eq!(names.len(), 800);
    }

    #[test]
    fn test_topology_document() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 0);
        for nodes in infra.nodes.values_mut() {
            nodes[0].data_drives.push(DriveInfo {
                uuid: "d2".into(),
                name: "data2".into(),
                size: 1024,
            });
        }

        let topology = serde_json::to_value(StorageTopology::for_infrastructure(&infra)).unwrap();
        assert_eq!(
            topology,
            json!({"clusters": [{"nodes": [{
                "node": {
                    "hostnames": {"manage": ["site-master0"], "storage": ["10.0.0.2"]},
                    "zone": 1
                },
                "devices": ["/dev/vdb", "/dev/vdc"]
            }]}]})
        );
    }

    #[tokio::test]
    async fn test_storage_single_node_flag() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 1);
        infra
            .extra_properties
            .insert(GLUSTERFS_CLIENT_INSTALLED, "true");

        harness
            .registry
            .provision(&mut infra, Product::Storage, &Parameters::new())
            .await
            .unwrap();

        let runs = harness.executor.runs().await;
        let vars = &runs.last().unwrap().vars;
        assert_eq!(vars["single_node"], "--single-node");
        assert_eq!(vars["install_client"], "false");
        assert!(StorageTopology::load(&infra.products).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_storage_replicated_from_three_nodes() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 2);

        harness
            .registry
            .provision(&mut infra, Product::Storage, &Parameters::new())
            .await
            .unwrap();

        let runs = harness.executor.runs().await;
        let vars = &runs.last().unwrap().vars;
        assert_eq!(vars["single_node"], "");
        assert_eq!(vars["install_client"], "true");
    }

    async fn rook_harness(state: Option<&str>) -> (Harness, Infrastructure) {
        let cluster = MemoryCluster::new();
        let status = state.map_or(json!({}), |s| json!({"state": s}));
        cluster
            .put(
                ResourceKind::CephCluster,
                CEPH_NAMESPACE,
                CEPH_CLUSTER,
                json!({"metadata": {"name": CEPH_CLUSTER}, "status": status}),
            )
            .await;
        let harness = Harness::with_cluster(cluster);
        let mut infra = harness.infrastructure(1, 2);
        KubernetesConfig::new("/tmp/config")
            .store(&mut infra.products)
            .unwrap();
        (harness, infra)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rook_waits_for_created_cluster() {
        let (harness, mut infra) = rook_harness(Some("Created")).await;

        harness
            .registry
            .provision(&mut infra, Product::Rook, &Parameters::new())
            .await
            .unwrap();

        let runs = harness.executor.runs().await;
        let vars = &runs.last().unwrap().vars;
        assert_eq!(vars["ha"], true);
        assert_eq!(vars["num_mons"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rook_times_out_while_creating() {
        let (harness, mut infra) = rook_harness(None).await;

        let err = harness
            .registry
            .provision(&mut infra, Product::Rook, &Parameters::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rook_rejects_failed_cluster() {
        let (harness, mut infra) = rook_harness(Some("Error")).await;

        let err = harness
            .registry
            .provision(&mut infra, Product::Rook, &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::UnexpectedStatus { actual, .. } if actual == "Error"));
    }

    #[tokio::test]
    async fn test_rook_rejects_small_drives() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 0);
        KubernetesConfig::new("/tmp/config")
            .store(&mut infra.products)
            .unwrap();
        for node in infra.nodes.values_mut().flatten() {
            node.data_drives[0].size = 1024;
        }

        let err = harness
            .registry
            .provision(&mut infra, Product::Rook, &Parameters::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("smaller than 5GB"));
        assert!(!harness
            .playbooks()
            .await
            .contains(&"kubernetes/rook/deploy_rook.yml".to_string()));
    }
}
