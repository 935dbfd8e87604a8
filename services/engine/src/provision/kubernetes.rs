//! Cluster bring-up: kubernetes, kubeadm and k3s.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::executor::ExtraVars;
use super::inventory::{Inventory, InventoryGroup};
use super::{
    KubernetesConfig, Product, ProductConfig, ProvisionError, Provisioner, ProvisionerRegistry,
    DOCKER_INSTALLED, KUBEADM_PREINSTALLED, WAIT_FOR_SSH,
};
use crate::model::{Infrastructure, Node, Parameters};

fn folder_vars(registry: &ProvisionerRegistry, infra: &Infrastructure) -> ExtraVars {
    let folder = registry.inventory_folder(infra);
    ExtraVars::from([(
        "inventory_folder".to_string(),
        Value::from(folder.display().to_string()),
    )])
}

/// Records the kubeconfig the bring-up playbooks leave in the inventory
/// folder.
fn record_cluster(
    registry: &ProvisionerRegistry,
    infra: &mut Infrastructure,
) -> Result<(), ProvisionError> {
    let config_file = registry.inventory_folder(infra).join("config");
    KubernetesConfig::new(config_file.display().to_string()).store(&mut infra.products)
}

fn single_master(product: Product, infra: &Infrastructure) -> Result<&Node, ProvisionError> {
    let masters: Vec<&Node> = infra.all_nodes().filter(|n| n.is_master()).collect();
    match masters.as_slice() {
        [master] => Ok(*master),
        [] => Err(ProvisionError::precondition(
            product,
            format!(
                "a node with role 'master' is required in infrastructure {}",
                infra.id
            ),
        )),
        _ => Err(ProvisionError::precondition(
            product,
            format!(
                "more than one master in infrastructure {}; high availability is not supported",
                infra.id
            ),
        )),
    }
}

/// Cluster from playbooks, installing docker first when needed.
pub struct KubernetesProvisioner;

#[async_trait]
impl Provisioner for KubernetesProvisioner {
    fn product(&self) -> Product {
        Product::Kubernetes
    }

    fn build_inventory(
        &self,
        _registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        _args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        Ok(Inventory::default_kubernetes(infra))
    }

    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        infra: &mut Infrastructure,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        let mut result = Parameters::new();

        if infra.extra_properties.get_bool(KUBEADM_PREINSTALLED) {
            registry
                .run_playbook("kubernetes/kubeadm.yml", Some(inventory), &ExtraVars::new())
                .await?;
        } else {
            if !infra.extra_properties.get_bool(DOCKER_INSTALLED) {
                info!("Installing docker before kubernetes");
                let docker_args = args.clone().with(WAIT_FOR_SSH, "false");
                result.extend(
                    registry
                        .provision(infra, Product::Docker, &docker_args)
                        .await?,
                );
                infra
                    .products
                    .entry(Product::Docker.name().to_string())
                    .or_insert_with(|| json!({}));
            }
            registry
                .run_playbook("kubernetes/main.yml", Some(inventory), &ExtraVars::new())
                .await?;
        }

        registry
            .run_playbook(
                "kubernetes/get_k8s_config.yml",
                Some(inventory),
                &folder_vars(registry, infra),
            )
            .await?;
        record_cluster(registry, infra)?;
        Ok(result)
    }
}

/// Single-master cluster; uses a preinstalled image when flagged, otherwise
/// delegates to [`KubernetesProvisioner`].
pub struct KubeadmProvisioner;

#[async_trait]
impl Provisioner for KubeadmProvisioner {
    fn product(&self) -> Product {
        Product::Kubeadm
    }

    fn build_inventory(
        &self,
        registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        let mut inventory = registry.build_inventory(Product::Kubernetes, infra, args)?;
        let master = single_master(self.product(), infra)?;
        let slaves = infra
            .all_nodes()
            .filter(|n| !n.is_master())
            .map(|n| n.hostname.clone())
            .collect();

        inventory.groups = vec![
            InventoryGroup::new("master", vec![master.hostname.clone()]),
            InventoryGroup::new("slaves", slaves),
        ];
        Ok(inventory)
    }

    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        infra: &mut Infrastructure,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        if !infra.extra_properties.get_bool(KUBEADM_PREINSTALLED) {
            let delegated = args.clone().with(WAIT_FOR_SSH, "false");
            return registry
                .provision(infra, Product::Kubernetes, &delegated)
                .await;
        }

        registry
            .run_playbook(
                "kubernetes/kubeadm.yml",
                Some(inventory),
                &folder_vars(registry, infra),
            )
            .await?;
        record_cluster(registry, infra)?;
        Ok(Parameters::new())
    }
}

/// Lightweight cluster: bootstrap the master, then join the rest.
pub struct K3sProvisioner;

#[async_trait]
impl Provisioner for K3sProvisioner {
    fn product(&self) -> Product {
        Product::K3s
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
        let master_ip = Value::from(single_master(self.product(), infra)?.ip.clone());

        let mut vars = folder_vars(registry, infra);
        vars.insert("master_ip".to_string(), master_ip.clone());
        registry
            .run_playbook("k3s/deploy_k3s.yml", Some(inventory), &vars)
            .await?;

        let vars = ExtraVars::from([("master_ip".to_string(), master_ip)]);
        registry
            .run_playbook("k3s/join_k3s_nodes.yml", Some(inventory), &vars)
            .await?;

        record_cluster(registry, infra)?;
        Ok(Parameters::new())
    }
}
