//! Arbitrary container images exposed on a node port.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use super::cluster::ResourceKind;
use super::inventory::Inventory;
use super::platform::{
    image_pull_secrets, node_port_service, parsed, require_kubernetes, required, InstallBatch,
};
use super::{
    KubernetesConfig, Product, ProductConfig, ProvisionError, Provisioner, ProvisionerRegistry,
};
use crate::model::{Infrastructure, Parameters};

const LABEL: &str = "serviceName";
const TERMINATION_GRACE_SECS: u32 = 10;

/// External port of every service, by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
}

impl ProductConfig for ServicesConfig {
    const KEY: &'static str = "services";
}

struct ServiceRequest {
    name: String,
    image: String,
    internal_port: u16,
    replicas: u32,
}

impl ServiceRequest {
    fn from_args(args: &Parameters) -> Result<Self, ProvisionError> {
        let product = Product::Services;
        Ok(Self {
            name: required(product, args, "name")?.to_string(),
            image: required(product, args, "image")?.to_string(),
            internal_port: parsed(
                product,
                required(product, args, "internal_port")?,
                "internal_port",
            )?,
            replicas: args
                .get("replicas")
                .map(|raw| parsed(product, raw, "replicas"))
                .transpose()?
                .unwrap_or(1),
        })
    }

    fn deployment_name(&self) -> String {
        format!("{}-deployment", self.name)
    }

    fn deployment(&self, config: &KubernetesConfig, external_port: u16) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": self.deployment_name(), "labels": {LABEL: self.name}},
            "spec": {
                "replicas": self.replicas,
                "selector": {"matchLabels": {LABEL: self.name}},
                "template": {
                    "metadata": {"labels": {LABEL: self.name}},
                    "spec": {
                        "terminationGracePeriodSeconds": TERMINATION_GRACE_SECS,
                        "imagePullSecrets": image_pull_secrets(config),
                        "containers": [{
                            "name": self.name,
                            "image": self.image,
                            "ports": [{
                                "containerPort": self.internal_port,
                                "hostPort": external_port,
                            }],
                        }],
                    },
                },
            },
        })
    }
}

pub struct ServicesProvisioner;

impl ServicesProvisioner {
    async fn install(
        &self,
        registry: &ProvisionerRegistry,
        batch: &mut InstallBatch<'_>,
        config: &mut KubernetesConfig,
        request: &ServiceRequest,
    ) -> Result<u16, ProvisionError> {
        let port = batch.allocate_port(config, registry.settings().port_range)?;
        batch
            .apply(
                ResourceKind::Deployment,
                &request.deployment_name(),
                request.deployment(config, port),
            )
            .await?;
        batch
            .apply(
                ResourceKind::Service,
                &request.name,
                node_port_service(&request.name, (LABEL, &request.name), port, request.internal_port),
            )
            .await?;
        Ok(port)
    }
}

#[async_trait]
impl Provisioner for ServicesProvisioner {
    fn product(&self) -> Product {
        Product::Services
    }

    fn requires_ssh(&self, _args: &Parameters) -> bool {
        false
    }

    fn installs_once(&self, _args: &Parameters) -> bool {
        false
    }

    fn build_inventory(
        &self,
        _registry: &ProvisionerRegistry,
        _infra: &Infrastructure,
        _args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        Ok(Inventory::default())
    }

    #[instrument(skip_all, fields(infrastructure = %infra.id))]
    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        _inventory: &Path,
        infra: &mut Infrastructure,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        let mut config = require_kubernetes(self.product(), infra)?;
        let request = ServiceRequest::from_args(args)?;

        let mut services = ServicesConfig::load(&config.deployments)?.unwrap_or_default();
        if services.ports.contains_key(&request.name) {
            return Err(ProvisionError::AlreadyExists {
                product: self.product(),
                name: request.name,
            });
        }
        info!(service = %request.name, image = %request.image, "Deploying service");

        let client = registry.cluster(&config).await?;
        let mut batch = InstallBatch::new(client.as_ref(), registry.reconciler(), registry.vault());
        let port = match self
            .install(registry, &mut batch, &mut config, &request)
            .await
        {
            Ok(port) => port,
            Err(e) => {
                error!(service = %request.name, error = %e, "Error deploying service, rolling back");
                batch.rollback(&mut config).await;
                return Err(e);
            }
        };

        services.ports.insert(request.name, port);
        services.store(&mut config.deployments)?;
        config.store(&mut infra.products)?;

        Ok(Parameters::new().with("port", port.to_string()))
    }
}
