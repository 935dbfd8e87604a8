//! Database instances as cluster workloads.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use hyde_id::SecretId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use super::cluster::ResourceKind;
use super::inventory::Inventory;
use super::platform::{node_port_service, require_kubernetes, secret_manifest, InstallBatch};
use super::{KubernetesConfig, Product, ProductConfig, ProvisionError, Provisioner, ProvisionerRegistry};
use crate::model::{Infrastructure, Parameters};
use crate::secrets::{generate_password, Secret};

const IMAGE: &str = "mysql/mysql-server";
const PORT: u16 = 3306;
const DATA_PATH: &str = "/var/lib/mysql";
const DEFAULT_VOLUME_SIZE: &str = "1Gi";
const LABEL: &str = "component";

/// Instances created so far. Ids are `mysql{n}` and never reused.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub num_instances: u32,
    #[serde(default)]
    pub instances: BTreeMap<String, DatabaseInstance>,
}

impl ProductConfig for DatabaseConfig {
    const KEY: &'static str = "mysql";
}

impl DatabaseConfig {
    pub fn next_instance_id(&self) -> String {
        format!("{}{}", Self::KEY, self.num_instances)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInstance {
    pub port: u16,
    pub root_secret: SecretId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_secret: Option<SecretId>,
}

/// Application account requested alongside the instance.
struct DatabaseUser {
    username: String,
    database: String,
    password: String,
}

impl DatabaseUser {
    fn from_args(args: &Parameters) -> Result<Option<Self>, ProvisionError> {
        let Some(username) = args.get("username") else {
            return Ok(None);
        };
        let database = args
            .get("database")
            .ok_or_else(|| ProvisionError::missing(Product::Mysql, "database"))?;
        let password = args
            .get("user_password")
            .map_or_else(|| generate_password(10, 3, 2), str::to_string);

        Ok(Some(Self {
            username: username.to_string(),
            database: database.to_string(),
            password,
        }))
    }
}

fn secret_ref(env: &str, secret: &str, key: &str) -> Value {
    json!({
        "name": env,
        "valueFrom": {"secretKeyRef": {"name": secret, "key": key}},
    })
}

/// One instance to create.
struct InstanceRequest<'a> {
    id: String,
    storage_class: &'a str,
    size: &'a str,
    user: Option<DatabaseUser>,
}

fn stateful_set(request: &InstanceRequest<'_>) -> Value {
    let id = request.id.as_str();
    let volume = format!("{id}-data");
    let mut env = vec![secret_ref(
        "MYSQL_ROOT_PASSWORD",
        &format!("{id}-root-pw"),
        "password",
    )];
    if let Some(user) = &request.user {
        env.push(json!({"name": "MYSQL_USER", "value": user.username}));
        env.push(json!({"name": "MYSQL_DATABASE", "value": user.database}));
        env.push(secret_ref("MYSQL_PASSWORD", &format!("{id}-user"), "password"));
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {"name": id, "labels": {LABEL: id}},
        "spec": {
            "serviceName": id,
            "replicas": 1,
            "selector": {"matchLabels": {LABEL: id}},
            "template": {
                "metadata": {"labels": {LABEL: id}},
                "spec": {
                    "terminationGracePeriodSeconds": 30,
                    "containers": [{
                        "name": "mysql",
                        "image": IMAGE,
                        "ports": [{"containerPort": PORT}],
                        "env": env,
                        "volumeMounts": [{"name": volume, "mountPath": DATA_PATH}],
                    }],
                },
            },
            "volumeClaimTemplates": [{
                "metadata": {"name": volume},
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "storageClassName": request.storage_class,
                    "resources": {"requests": {"storage": request.size}},
                },
            }],
        },
    })
}

pub struct MysqlProvisioner;

impl MysqlProvisioner {
    /// Creates the instance's secrets, workload and service in order.
    async fn install(
        &self,
        registry: &ProvisionerRegistry,
        batch: &mut InstallBatch<'_>,
        config: &mut KubernetesConfig,
        request: &InstanceRequest<'_>,
    ) -> Result<DatabaseInstance, ProvisionError> {
        let id = request.id.as_str();
        let root_password = generate_password(10, 3, 2);
        let root_name = format!("{id}-root-pw");
        let root_data = BTreeMap::from([("password".to_string(), root_password)]);
        let root_secret = batch
            .store_secret(&Secret::new(root_data.clone()).with_description(root_name.clone()))
            .await?;
        batch
            .apply(ResourceKind::Secret, &root_name, secret_manifest(&root_name, &root_data))
            .await?;

        let user_secret = match &request.user {
            Some(user) => {
                let name = format!("{id}-user");
                let secret = Secret::basic_auth(&user.username, &user.password)
                    .with_description(name.clone());
                let secret_id = batch.store_secret(&secret).await?;
                batch
                    .apply(ResourceKind::Secret, &name, secret_manifest(&name, &secret.data))
                    .await?;
                Some(secret_id)
            }
            None => None,
        };

        info!("Creating database workload");
        batch
            .apply(
                ResourceKind::StatefulSet,
                id,
                stateful_set(request),
            )
            .await?;

        let port = batch.allocate_port(config, registry.settings().port_range)?;
        batch
            .apply(
                ResourceKind::Service,
                id,
                node_port_service(id, (LABEL, id), port, PORT),
            )
            .await?;

        Ok(DatabaseInstance {
            port,
            root_secret,
            user_secret,
        })
    }
}

#[async_trait]
impl Provisioner for MysqlProvisioner {
    fn product(&self) -> Product {
        Product::Mysql
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
        let storage_class = args
            .get("storage_class")
            .ok_or_else(|| ProvisionError::missing(self.product(), "storage_class"))?;
        let user = DatabaseUser::from_args(args)?;

        let mut databases = DatabaseConfig::load(&config.deployments)?.unwrap_or_default();
        let request = InstanceRequest {
            id: databases.next_instance_id(),
            storage_class,
            size: args.get("size").unwrap_or(DEFAULT_VOLUME_SIZE),
            user,
        };
        let id = request.id.clone();
        info!(instance = %id, "Deploying database instance");

        let client = registry.cluster(&config).await?;
        let mut batch = InstallBatch::new(client.as_ref(), registry.reconciler(), registry.vault());
        let installed = self
            .install(registry, &mut batch, &mut config, &request)
            .await;

        let instance = match installed {
            Ok(instance) => instance,
            Err(e) => {
                error!(instance = %id, error = %e, "Error deploying database, rolling back");
                batch.rollback(&mut config).await;
                return Err(e);
            }
        };

        config
            .secrets
            .insert(format!("{id}-root-pw"), instance.root_secret);
        if let Some(user_secret) = instance.user_secret {
            config.secrets.insert(format!("{id}-user"), user_secret);
        }

        let mut result = Parameters::new()
            .with("port", instance.port.to_string())
            .with("instance_id", id.clone())
            .with("root_secret", instance.root_secret.to_string());
        if let Some(user_secret) = instance.user_secret {
            result.insert("user_secret", user_secret.to_string());
        }

        databases.num_instances += 1;
        databases.instances.insert(id, instance);
        databases.store(&mut config.deployments)?;
        config.store(&mut infra.products)?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::cluster::{ClusterClient, MemoryCluster, DEFAULT_NAMESPACE};
    use crate::provision::testing::Harness;
    use crate::secrets::Vault;

    fn with_cluster(harness: &Harness) -> Infrastructure {
        let mut infra = harness.infrastructure(1, 1);
        KubernetesConfig::new("/tmp/config")
            .store(&mut infra.products)
            .unwrap();
        infra
    }

    fn args() -> Parameters {
        Parameters::new().with("storage_class", "rook-ceph-block")
    }

    #[tokio::test]
    async fn test_instances_get_fresh_ids_and_ports() {
        let harness = Harness::new();
        let mut infra = with_cluster(&harness);

        let first = harness
            .registry
            .provision(&mut infra, Product::Mysql, &args())
            .await
            .unwrap();
        let second = harness
            .registry
            .provision(&mut infra, Product::Mysql, &args())
            .await
            .unwrap();

        assert_eq!(first.get("instance_id"), Some("mysql0"));
        assert_eq!(first.get("port"), Some("30000"));
        assert_eq!(second.get("instance_id"), Some("mysql1"));
        assert_eq!(second.get("port"), Some("30001"));

        let config = KubernetesConfig::load(&infra.products).unwrap().unwrap();
        let databases = DatabaseConfig::load(&config.deployments).unwrap().unwrap();
        assert_eq!(databases.num_instances, 2);
        assert_eq!(databases.instances["mysql1"].port, 30001);

        let root: SecretId = first.get("root_secret").unwrap().parse().unwrap();
        assert_eq!(config.secrets["mysql0-root-pw"], root);
        assert!(harness.vault.get_secret(&root).await.unwrap().get("password").is_some());

        let sets = harness.cluster.names(ResourceKind::StatefulSet).await;
        assert_eq!(sets, vec!["mysql0", "mysql1"]);
        assert!(harness.playbooks().await.is_empty());
    }

    #[tokio::test]
    async fn test_user_secret_and_environment() {
        let harness = Harness::new();
        let mut infra = with_cluster(&harness);
        let args = args()
            .with("username", "app")
            .with("database", "orders")
            .with("user_password", "pw");

        let result = harness
            .registry
            .provision(&mut infra, Product::Mysql, &args)
            .await
            .unwrap();

        let user: SecretId = result.get("user_secret").unwrap().parse().unwrap();
        let secret = harness.vault.get_secret(&user).await.unwrap();
        assert_eq!(secret.as_basic_auth(), Some(("app", "pw")));

        let set = harness
            .cluster
            .get(ResourceKind::StatefulSet, DEFAULT_NAMESPACE, "mysql0")
            .await
            .unwrap()
            .unwrap();
        let env = set
            .pointer("/spec/template/spec/containers/0/env")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(env.len(), 4);
        assert_eq!(
            set.pointer("/spec/volumeClaimTemplates/0/spec/storageClassName")
                .unwrap(),
            "rook-ceph-block"
        );
    }

    #[tokio::test]
    async fn test_username_requires_database() {
        let harness = Harness::new();
        let mut infra = with_cluster(&harness);

        let err = harness
            .registry
            .provision(&mut infra, Product::Mysql, &args().with("username", "app"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MissingArgument {
                argument: "database",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requires_storage_class_and_cluster() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 0);
        let err = harness
            .registry
            .provision(&mut infra, Product::Mysql, &args())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Precondition { .. }));

        let mut infra = with_cluster(&harness);
        let err = harness
            .registry
            .provision(&mut infra, Product::Mysql, &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MissingArgument {
                argument: "storage_class",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_service_rolls_back() {
        let harness =
            Harness::with_cluster(MemoryCluster::new().failing_for(ResourceKind::Service, "mysql0"));
        let mut infra = with_cluster(&harness);
        let before = infra.clone();

        let err = harness
            .registry
            .provision(&mut infra, Product::Mysql, &args())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Reconcile(_)));
        assert!(harness.cluster.is_empty().await);
        assert_eq!(harness.vault.len().await, 0);
        assert_eq!(infra.products, before.products);
    }
}
