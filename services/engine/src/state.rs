//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::Config;
use crate::controller::DeploymentController;
use crate::db::Stores;
use crate::orchestrator::InfrastructureOrchestrator;
use crate::provider::DefaultProviderResolver;
use crate::provision::cluster::KubeConnector;
use crate::provision::executor::AnsibleExecutor;
use crate::provision::{ProvisionError, ProvisionerRegistry};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    controller: DeploymentController,
    stores: Stores,
}

impl AppState {
    pub fn new(controller: DeploymentController, stores: Stores) -> Self {
        Self {
            inner: Arc::new(AppStateInner { controller, stores }),
        }
    }

    /// Wires the production collaborators: providers resolved from the
    /// vault, `ansible-playbook` runs and the Kubernetes API.
    pub fn from_config(config: &Config, stores: Stores) -> Result<Self, ProvisionError> {
        let resolver = DefaultProviderResolver::new(
            stores.vault.clone(),
            config.provider_timeouts,
            config.vm_username.clone(),
            config.dev_mode,
        );
        let registry = ProvisionerRegistry::new(
            config.provisioning.clone(),
            Arc::new(AnsibleExecutor::new(config.ansible_playbook.clone())),
            Arc::new(KubeConnector::new(config.kube_timeout)),
            stores.vault.clone(),
        )?;
        let controller = DeploymentController::new(
            stores.repository.clone(),
            stores.vault.clone(),
            InfrastructureOrchestrator::new(Arc::new(resolver)),
            registry,
        );
        Ok(Self::new(controller, stores))
    }

    pub fn controller(&self) -> &DeploymentController {
        &self.inner.controller
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }
}
