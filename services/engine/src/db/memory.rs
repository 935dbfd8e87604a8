//! In-process stores.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hyde_id::{DeploymentId, SecretId};
use tokio::sync::RwLock;

use super::{DbError, DeploymentRepository};
use crate::model::Deployment;
use crate::secrets::{Secret, Vault};

/// Deployment records kept in a map. State is lost on restart.
#[derive(Default)]
pub struct MemoryRepository {
    deployments: RwLock<BTreeMap<DeploymentId, Deployment>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentRepository for MemoryRepository {
    async fn save(&self, deployment: &Deployment) -> Result<(), DbError> {
        let mut deployments = self.deployments.write().await;
        if deployments.contains_key(&deployment.id) {
            return Err(DbError::AlreadyExists {
                kind: "deployment",
                id: deployment.id.to_string(),
            });
        }
        deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> Result<Deployment, DbError> {
        self.deployments
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::deployment_not_found(id))
    }

    async fn list(&self) -> Result<Vec<Deployment>, DbError> {
        Ok(self.deployments.read().await.values().cloned().collect())
    }

    async fn update(&self, deployment: &Deployment) -> Result<(), DbError> {
        match self.deployments.write().await.get_mut(&deployment.id) {
            Some(stored) => {
                *stored = deployment.clone();
                Ok(())
            }
            None => Err(DbError::deployment_not_found(deployment.id)),
        }
    }

    async fn delete(&self, id: &DeploymentId) -> Result<(), DbError> {
        self.deployments
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DbError::deployment_not_found(id))
    }
}

#[derive(Default)]
pub struct MemoryVault {
    secrets: RwLock<BTreeMap<SecretId, Secret>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }
}

#[async_trait]
impl Vault for MemoryVault {
    async fn add_secret(&self, secret: &Secret) -> Result<SecretId, DbError> {
        let id = SecretId::new();
        self.secrets.write().await.insert(id, secret.clone());
        Ok(id)
    }

    async fn get_secret(&self, id: &SecretId) -> Result<Secret, DbError> {
        self.secrets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::secret_not_found(id))
    }

    async fn update_secret(&self, id: &SecretId, secret: &Secret) -> Result<(), DbError> {
        match self.secrets.write().await.get_mut(id) {
            Some(stored) => {
                *stored = secret.clone();
                Ok(())
            }
            None => Err(DbError::secret_not_found(id)),
        }
    }

    async fn delete_secret(&self, id: &SecretId) -> Result<(), DbError> {
        self.secrets
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DbError::secret_not_found(id))
    }
}
