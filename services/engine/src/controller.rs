//! Deployment use cases.
//!
//! The controller is the only component that loads and persists deployment
//! records. Provisioners and the orchestrator work on in-memory copies;
//! nothing reaches the repository until a use case has succeeded, except
//! the partial records that create and delete deliberately keep.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hyde_id::{DeploymentId, InfrastructureId};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::db::{DbError, DeploymentRepository};
use crate::model::{
    Deployment, DeploymentRequest, DeploymentStatus, InfrastructureSpec, Parameters, ProviderRef,
};
use crate::orchestrator::InfrastructureOrchestrator;
use crate::provider::client::megabytes_to_bytes;
use crate::provider::ProviderError;
use crate::provision::{Product, ProvisionError, ProvisionerRegistry};
use crate::secrets::{Secret, Vault};

/// Controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No such infrastructure in the deployment.
    #[error("infrastructure {infrastructure} not found in deployment {deployment}")]
    InfrastructureNotFound {
        deployment: DeploymentId,
        infrastructure: InfrastructureId,
    },

    /// The request was rejected before any side effect.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The product is already installed.
    #[error("product {product} already present in infrastructure {infrastructure}")]
    AlreadyInstalled {
        product: Product,
        infrastructure: InfrastructureId,
    },

    /// Some infrastructures or nodes failed. The record, with everything
    /// that was created, has been persisted.
    #[error("deployment {} failed: {}", deployment.id, failures.join("; "))]
    PartialDeployment {
        deployment: Box<Deployment>,
        failures: Vec<String>,
    },

    /// Some nodes could not be deleted; they stay in the record.
    #[error("failed to delete nodes: {}", describe_teardown(errors))]
    Teardown {
        errors: BTreeMap<String, ProviderError>,
    },

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Db(#[from] DbError),
}

fn describe_teardown(errors: &BTreeMap<String, ProviderError>) -> String {
    errors
        .iter()
        .map(|(host, e)| format!("{host}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControllerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::InfrastructureNotFound { .. } => true,
            Self::Db(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Create, provision, tear down and read deployments.
pub struct DeploymentController {
    repository: Arc<dyn DeploymentRepository>,
    vault: Arc<dyn Vault>,
    orchestrator: InfrastructureOrchestrator,
    registry: ProvisionerRegistry,
    /// Serializes read-modify-write cycles on existing records.
    mutations: Mutex<()>,
}

impl DeploymentController {
    pub fn new(
        repository: Arc<dyn DeploymentRepository>,
        vault: Arc<dyn Vault>,
        orchestrator: InfrastructureOrchestrator,
        registry: ProvisionerRegistry,
    ) -> Self {
        Self {
            repository,
            vault,
            orchestrator,
            registry,
            mutations: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ProvisionerRegistry {
        &self.registry
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Deploys every infrastructure of `request` concurrently.
    ///
    /// The record is saved as `creating` before any node work starts and
    /// updated once the fan-out has drained. Failed infrastructures stay in
    /// the record with their surviving nodes.
    #[instrument(skip_all, fields(deployment = %request.name))]
    pub async fn create_deployment(
        &self,
        request: DeploymentRequest,
    ) -> Result<Deployment, ControllerError> {
        validate(&request)?;

        let mut infrastructures = Vec::with_capacity(request.infrastructures.len());
        for spec in request.infrastructures {
            let provider = self.provider_ref(&spec).await?;
            infrastructures.push((spec, provider));
        }

        let mut deployment = Deployment::new(request.name);
        self.repository.save(&deployment).await?;
        info!(
            deployment_id = %deployment.id,
            infrastructures = infrastructures.len(),
            "Deployment created"
        );

        let mut failures = Vec::new();
        for outcome in self.orchestrator.deploy_all(infrastructures).await {
            match outcome.result {
                Ok(report) => {
                    failures.extend(report.failures.iter().map(|f| f.to_string()));
                    deployment.infrastructures.push(report.infrastructure);
                }
                Err(e) => {
                    error!(infrastructure = %outcome.name, error = %e, "Infrastructure not deployed");
                    failures.push(format!("infrastructure {}: {e}", outcome.name));
                }
            }
        }

        deployment.status = if failures.is_empty() {
            DeploymentStatus::Running
        } else {
            DeploymentStatus::Failed
        };
        deployment.touch();
        self.repository.update(&deployment).await?;

        if failures.is_empty() {
            info!(deployment_id = %deployment.id, "Deployment running");
            Ok(deployment)
        } else {
            warn!(deployment_id = %deployment.id, failed = failures.len(), "Deployment failed");
            Err(ControllerError::PartialDeployment {
                deployment: Box::new(deployment),
                failures,
            })
        }
    }

    /// Persistable provider reference; inline credentials go to the vault.
    async fn provider_ref(&self, spec: &InfrastructureSpec) -> Result<ProviderRef, ControllerError> {
        let info = &spec.provider;
        let secret_id = match info.secret_id {
            Some(id) => id,
            None => {
                let secret = Secret::new(info.credentials.clone())
                    .with_description(format!("{} provider credentials", spec.name));
                self.vault.add_secret(&secret).await?
            }
        };
        Ok(ProviderRef {
            api_endpoint: info.api_endpoint.clone(),
            api_type: info.api_type.clone(),
            secret_id,
        })
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes every node of one infrastructure.
    ///
    /// On partial failure only the nodes that could not be deleted are kept
    /// and the record is saved. Otherwise the infrastructure is removed, and
    /// the record with it once it has none left. Returns the deployment as
    /// it stands afterwards.
    #[instrument(skip(self), fields(deployment = %deployment_id, infrastructure = %infra_id))]
    pub async fn delete_infrastructure(
        &self,
        deployment_id: &DeploymentId,
        infra_id: &InfrastructureId,
    ) -> Result<Deployment, ControllerError> {
        let _guard = self.mutations.lock().await;

        let mut deployment = self.repository.get(deployment_id).await?;
        let index = deployment
            .infrastructures
            .iter()
            .position(|i| i.id == *infra_id)
            .ok_or(ControllerError::InfrastructureNotFound {
                deployment: *deployment_id,
                infrastructure: *infra_id,
            })?;

        let errors = self
            .orchestrator
            .teardown_infrastructure(&deployment.infrastructures[index])
            .await?;

        if !errors.is_empty() {
            let infra = &mut deployment.infrastructures[index];
            for nodes in infra.nodes.values_mut() {
                nodes.retain(|n| errors.contains_key(&n.hostname));
            }
            infra.nodes.retain(|_, nodes| !nodes.is_empty());
            deployment.touch();
            self.repository.update(&deployment).await?;
            warn!(failed = errors.len(), "Infrastructure partially deleted");
            return Err(ControllerError::Teardown { errors });
        }

        deployment.infrastructures.remove(index);
        deployment.touch();
        if deployment.infrastructures.is_empty() {
            self.repository.delete(deployment_id).await?;
            info!("Last infrastructure removed, deployment deleted");
        } else {
            self.repository.update(&deployment).await?;
            info!("Infrastructure removed");
        }
        Ok(deployment)
    }

    // =========================================================================
    // Provision
    // =========================================================================

    /// Installs `product` on one infrastructure and persists the result.
    ///
    /// Products that install once are refused when already present; the
    /// others (database instances, services, redirects) may repeat. Nothing
    /// is persisted on failure.
    #[instrument(skip(self, args), fields(deployment = %deployment_id, infrastructure = %infra_id))]
    pub async fn provision(
        &self,
        deployment_id: &DeploymentId,
        infra_id: &InfrastructureId,
        product: &str,
        args: Parameters,
    ) -> Result<Deployment, ControllerError> {
        let product: Product = product.parse()?;
        let _guard = self.mutations.lock().await;

        let mut deployment = self.repository.get(deployment_id).await?;
        let infra = deployment.infrastructure_mut(infra_id).ok_or(
            ControllerError::InfrastructureNotFound {
                deployment: *deployment_id,
                infrastructure: *infra_id,
            },
        )?;

        let installs_once = self.registry.get(product)?.installs_once(&args);
        if installs_once && infra.has_product(product.name()) {
            return Err(ControllerError::AlreadyInstalled {
                product,
                infrastructure: *infra_id,
            });
        }

        let result = self.registry.provision(infra, product, &args).await?;
        infra
            .products
            .entry(product.name().to_string())
            .or_insert_with(|| json!({}));
        info!(product = %product, result = ?result, "Product provisioned");

        deployment.touch();
        self.repository.update(&deployment).await?;
        Ok(deployment)
    }

    // =========================================================================
    // Read
    // =========================================================================

    pub async fn get_deployment(&self, id: &DeploymentId) -> Result<Deployment, ControllerError> {
        Ok(self.repository.get(id).await?)
    }

    pub async fn list_deployments(&self) -> Result<Vec<Deployment>, ControllerError> {
        Ok(self.repository.list().await?)
    }
}

fn validate(request: &DeploymentRequest) -> Result<(), ControllerError> {
    let invalid = |msg: String| -> Result<(), ControllerError> {
        Err(ControllerError::Validation(msg))
    };

    if request.name.trim().is_empty() {
        return invalid("deployment name is empty".to_string());
    }
    if request.infrastructures.is_empty() {
        return invalid("no infrastructures requested".to_string());
    }

    let mut names = BTreeSet::new();
    for spec in &request.infrastructures {
        if spec.name.trim().is_empty() {
            return invalid("infrastructure name is empty".to_string());
        }
        if !names.insert(spec.name.as_str()) {
            return invalid(format!("duplicate infrastructure name {}", spec.name));
        }
        if spec.resources.is_empty() {
            return invalid(format!("infrastructure {} has no resources", spec.name));
        }
        if spec.provider.secret_id.is_none() && spec.provider.credentials.is_empty() {
            return invalid(format!(
                "infrastructure {} has neither a secret id nor credentials",
                spec.name
            ));
        }

        let mut resources = BTreeSet::new();
        for resource in &spec.resources {
            if !resources.insert(resource.name.as_str()) {
                return invalid(format!(
                    "duplicate resource {} in infrastructure {}",
                    resource.name, spec.name
                ));
            }
            if resource.role.trim().is_empty() {
                return invalid(format!("resource {} has no role", resource.name));
            }
            if let Some((what, mb)) = resource
                .sizes_mb()
                .find(|(_, mb)| megabytes_to_bytes(*mb).is_none())
            {
                return invalid(format!(
                    "{what} of resource {} is too large: {mb} MB",
                    resource.name
                ));
            }
        }
    }
    Ok(())
}
