//! Shared machinery for products installed as cluster resources.

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyde_id::SecretId;
use hyde_networking::{PortAllocator, PortRange};
use hyde_reconcile::Reconciler;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::cluster::{ClusterClient, ClusterResource, ResourceKind, DEFAULT_NAMESPACE};
use super::{Product, ProductConfig, ProvisionError};
use crate::model::{Infrastructure, Parameters};
use crate::secrets::{Secret, Vault};

/// Configuration recorded by every product that brings up a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Path of the kubeconfig fetched from the master.
    pub config_file: String,

    /// Pull secret attached to every workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registries_secret: Option<String>,

    /// Node ports handed out on this cluster. Created on first use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortAllocator>,

    /// Cluster secret name to vault id.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretId>,

    /// Configuration of products installed as cluster resources.
    #[serde(default)]
    pub deployments: BTreeMap<String, Value>,
}

impl ProductConfig for KubernetesConfig {
    const KEY: &'static str = "kubernetes";
}

impl KubernetesConfig {
    pub fn new(config_file: impl Into<String>) -> Self {
        Self {
            config_file: config_file.into(),
            ..Self::default()
        }
    }

    pub fn ports_mut(&mut self, range: PortRange) -> &mut PortAllocator {
        self.ports.get_or_insert_with(|| PortAllocator::new(range))
    }
}

/// Loads the cluster configuration `product` installs onto.
pub(crate) fn require_kubernetes(
    product: Product,
    infra: &Infrastructure,
) -> Result<KubernetesConfig, ProvisionError> {
    KubernetesConfig::load(&infra.products)?.ok_or_else(|| {
        ProvisionError::precondition(
            product,
            format!("kubernetes is not installed in infrastructure {}", infra.id),
        )
    })
}

pub(crate) fn required<'a>(
    product: Product,
    args: &'a Parameters,
    argument: &'static str,
) -> Result<&'a str, ProvisionError> {
    args.get(argument)
        .ok_or_else(|| ProvisionError::missing(product, argument))
}

pub(crate) fn parsed<T>(
    product: Product,
    raw: &str,
    argument: &'static str,
) -> Result<T, ProvisionError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ProvisionError::InvalidArgument {
        product,
        argument,
        reason: e.to_string(),
    })
}

// =============================================================================
// Manifests
// =============================================================================

pub(crate) fn secret_manifest(name: &str, data: &BTreeMap<String, String>) -> Value {
    let encoded: BTreeMap<&str, String> = data
        .iter()
        .map(|(k, v)| (k.as_str(), BASE64.encode(v)))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": name},
        "type": "Opaque",
        "data": encoded,
    })
}

/// Service exposing `target_port` of pods labelled `selector` on node port
/// `port`.
pub(crate) fn node_port_service(
    name: &str,
    selector: (&str, &str),
    port: u16,
    target_port: u16,
) -> Value {
    let (label, value) = selector;
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": name},
        "spec": {
            "type": "NodePort",
            "selector": {label: value},
            "ports": [{
                "port": port,
                "nodePort": port,
                "targetPort": target_port,
            }],
        },
    })
}

pub(crate) fn image_pull_secrets(config: &KubernetesConfig) -> Value {
    match &config.registries_secret {
        Some(secret) => json!([{"name": secret}]),
        None => json!([]),
    }
}

// =============================================================================
// Install batches
// =============================================================================

/// Side effects of one platform install, remembered so a failed install can
/// be undone: reconciled resources, vault secrets and allocated ports.
pub(crate) struct InstallBatch<'a> {
    client: &'a dyn ClusterClient,
    reconciler: &'a Reconciler,
    vault: &'a dyn Vault,
    resources: Vec<(ResourceKind, String, String)>,
    secrets: Vec<SecretId>,
    ports: Vec<u16>,
}

impl<'a> InstallBatch<'a> {
    pub fn new(
        client: &'a dyn ClusterClient,
        reconciler: &'a Reconciler,
        vault: &'a dyn Vault,
    ) -> Self {
        Self {
            client,
            reconciler,
            vault,
            resources: Vec::new(),
            secrets: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub async fn apply(
        &mut self,
        kind: ResourceKind,
        name: &str,
        manifest: Value,
    ) -> Result<Value, ProvisionError> {
        self.apply_in(kind, DEFAULT_NAMESPACE, name, manifest).await
    }

    pub async fn apply_in(
        &mut self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        manifest: Value,
    ) -> Result<Value, ProvisionError> {
        let ops = ClusterResource::new(self.client, kind, namespace, manifest);
        let resource = self.reconciler.create_or_replace(name, &ops).await?;
        debug!(kind = %kind, namespace = %namespace, name = %name, "Resource reconciled");
        self.resources.push((kind, namespace.to_string(), name.to_string()));
        Ok(resource)
    }

    pub async fn store_secret(&mut self, secret: &Secret) -> Result<SecretId, ProvisionError> {
        let id = self.vault.add_secret(secret).await?;
        self.secrets.push(id);
        Ok(id)
    }

    pub fn allocate_port(
        &mut self,
        config: &mut KubernetesConfig,
        range: PortRange,
    ) -> Result<u16, ProvisionError> {
        let port = config.ports_mut(range).get_new_free_port()?;
        self.ports.push(port);
        Ok(port)
    }

    /// Deletes resources newest first, then secrets, then frees ports.
    /// Failures are logged and never stop the rollback.
    pub async fn rollback(self, config: &mut KubernetesConfig) {
        for (kind, namespace, name) in self.resources.into_iter().rev() {
            if let Err(e) = self.client.delete(kind, &namespace, &name).await {
                warn!(kind = %kind, name = %name, error = %e, "Error rolling back resource");
            }
        }
        for id in self.secrets {
            if let Err(e) = self.vault.delete_secret(&id).await {
                warn!(secret = %id, error = %e, "Error rolling back secret");
            }
        }
        if let Some(ports) = config.ports.as_mut() {
            for port in self.ports {
                ports.liberate_port(port);
            }
        }
    }
}
