//! Target-platform resource store.
//!
//! Managed resources are plain JSON manifests. [`KubeClient`] drives a
//! real cluster through the Kubernetes API; [`MemoryCluster`] keeps them in
//! a map.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyde_reconcile::ResourceOps;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::TypeMeta;
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Namespace for every resource the engine manages.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource kinds the engine reconciles or reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Deployment,
    Service,
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    StatefulSet,
    ServiceAccount,
    Ingress,
    ClusterRole,
    ClusterRoleBinding,
    CephCluster,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::ConfigMap => "configmap",
            Self::Secret => "secret",
            Self::PersistentVolumeClaim => "persistentvolumeclaim",
            Self::StatefulSet => "statefulset",
            Self::ServiceAccount => "serviceaccount",
            Self::Ingress => "ingress",
            Self::ClusterRole => "clusterrole",
            Self::ClusterRoleBinding => "clusterrolebinding",
            Self::CephCluster => "cephcluster",
        }
    }

    /// Cluster-scoped kinds ignore the namespace they are addressed with.
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, Self::ClusterRole | Self::ClusterRoleBinding)
    }

    /// Group, version and plural the API serves this kind under.
    pub fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = match self {
            Self::Deployment => ("apps", "v1", "Deployment", "deployments"),
            Self::Service => ("", "v1", "Service", "services"),
            Self::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            Self::Secret => ("", "v1", "Secret", "secrets"),
            Self::PersistentVolumeClaim => {
                ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims")
            }
            Self::StatefulSet => ("apps", "v1", "StatefulSet", "statefulsets"),
            Self::ServiceAccount => ("", "v1", "ServiceAccount", "serviceaccounts"),
            Self::Ingress => ("networking.k8s.io", "v1", "Ingress", "ingresses"),
            Self::ClusterRole => (
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRole",
                "clusterroles",
            ),
            Self::ClusterRoleBinding => (
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRoleBinding",
                "clusterrolebindings",
            ),
            Self::CephCluster => ("ceph.rook.io", "v1", "CephCluster", "cephclusters"),
        };
        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{group}/{version}")
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version,
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The kubeconfig could not be read or used.
    #[error("kubeconfig {path}: {message}")]
    Kubeconfig { path: PathBuf, message: String },

    /// The API server refused or failed the call.
    #[error("kubernetes API: {0}")]
    Api(#[from] kube::Error),

    /// A manifest or response was not a resource document.
    #[error("decoding cluster resource: {0}")]
    Decode(#[from] serde_json::Error),

    /// A store rejected the operation.
    #[error("{kind} {name}: {message}")]
    Rejected {
        kind: ResourceKind,
        name: String,
        message: String,
    },
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// `Ok(None)` when the resource does not exist.
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, ClusterError>;

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError>;

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        manifest: &Value,
    ) -> Result<Option<Value>, ClusterError>;
}

/// Opens a client for the cluster described by a kubeconfig.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, kubeconfig: &Path) -> Result<Arc<dyn ClusterClient>, ClusterError>;
}

// =============================================================================
// Reconcile adapter
// =============================================================================

/// One manifest bound to a client, for [`hyde_reconcile::Reconciler`].
pub struct ClusterResource<'a> {
    client: &'a dyn ClusterClient,
    kind: ResourceKind,
    namespace: &'a str,
    manifest: Value,
}

impl<'a> ClusterResource<'a> {
    pub fn new(
        client: &'a dyn ClusterClient,
        kind: ResourceKind,
        namespace: &'a str,
        manifest: Value,
    ) -> Self {
        Self {
            client,
            kind,
            namespace,
            manifest,
        }
    }
}

#[async_trait]
impl ResourceOps for ClusterResource<'_> {
    type Resource = Value;
    type Error = ClusterError;

    async fn get(&self, name: &str) -> Result<Option<Value>, ClusterError> {
        self.client.get(self.kind, self.namespace, name).await
    }

    async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        self.client.delete(self.kind, self.namespace, name).await
    }

    async fn create(&self) -> Result<Option<Value>, ClusterError> {
        self.client
            .create(self.kind, self.namespace, &self.manifest)
            .await
    }
}

// =============================================================================
// Kubernetes API
// =============================================================================

/// Connector producing [`KubeClient`]s from kubeconfig files.
pub struct KubeConnector {
    timeout: Duration,
}

impl KubeConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, kubeconfig: &Path) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let invalid = |message: String| ClusterError::Kubeconfig {
            path: kubeconfig.to_path_buf(),
            message,
        };

        let file = Kubeconfig::read_from(kubeconfig).map_err(|e| invalid(e.to_string()))?;
        let mut config = Config::from_custom_kubeconfig(file, &KubeConfigOptions::default())
            .await
            .map_err(|e| invalid(e.to_string()))?;
        config.connect_timeout = Some(self.timeout);
        config.read_timeout = Some(self.timeout);

        debug!(
            kubeconfig = %kubeconfig.display(),
            cluster = %config.cluster_url,
            "Connecting to cluster"
        );
        Ok(Arc::new(KubeClient::new(Client::try_from(config)?)))
    }
}

/// [`ClusterClient`] over the Kubernetes API, using dynamic objects so any
/// [`ResourceKind`] goes through the same calls.
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> (Api<DynamicObject>, ApiResource) {
        let resource = kind.api_resource();
        let api = if kind.is_namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        (api, resource)
    }
}

/// `Ok(None)` for a 404, the error otherwise.
fn absent_if_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, ClusterError> {
        let (api, _) = self.api(kind, namespace);
        match absent_if_not_found(api.get(name).await)? {
            Some(object) => Ok(Some(serde_json::to_value(object)?)),
            None => Ok(None),
        }
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let (api, _) = self.api(kind, namespace);
        if absent_if_not_found(api.delete(name, &DeleteParams::background()).await)?.is_none() {
            debug!(kind = %kind, name = %name, "Resource already gone");
        }
        Ok(())
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        manifest: &Value,
    ) -> Result<Option<Value>, ClusterError> {
        let (api, resource) = self.api(kind, namespace);
        let mut object: DynamicObject = serde_json::from_value(manifest.clone())?;
        object.types.get_or_insert_with(|| TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });

        info!(kind = %kind, namespace = %namespace, "Creating cluster resource");
        let created = api.create(&PostParams::default(), &object).await?;
        Ok(Some(serde_json::to_value(created)?))
    }
}

// =============================================================================
// In-memory store
// =============================================================================

type ResourceKey = (ResourceKind, String, String);

/// In-memory resource store, for development and tests.
///
/// `Arc<MemoryCluster>` is its own connector: every kubeconfig maps to the
/// same store.
#[derive(Default)]
pub struct MemoryCluster {
    resources: RwLock<BTreeMap<ResourceKey, Value>>,
    failing: BTreeSet<(ResourceKind, String)>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects creation of the named resource.
    pub fn failing_for(mut self, kind: ResourceKind, name: impl Into<String>) -> Self {
        self.failing.insert((kind, name.into()));
        self
    }

    /// Stores a resource directly, bypassing the failure list.
    pub async fn put(&self, kind: ResourceKind, namespace: &str, name: &str, value: Value) {
        self.resources
            .write()
            .await
            .insert((kind, namespace.to_string(), name.to_string()), value);
    }

    /// Names of stored resources of `kind`.
    pub async fn names(&self, kind: ResourceKind) -> Vec<String> {
        self.resources
            .read()
            .await
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

fn manifest_name(manifest: &Value) -> Option<&str> {
    manifest.pointer("/metadata/name").and_then(Value::as_str)
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, ClusterError> {
        let key = (kind, namespace.to_string(), name.to_string());
        Ok(self.resources.read().await.get(&key).cloned())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let key = (kind, namespace.to_string(), name.to_string());
        self.resources.write().await.remove(&key);
        Ok(())
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        manifest: &Value,
    ) -> Result<Option<Value>, ClusterError> {
        let name = manifest_name(manifest)
            .ok_or_else(|| ClusterError::Rejected {
                kind,
                name: String::new(),
                message: "manifest has no metadata.name".to_string(),
            })?
            .to_string();

        if self.failing.contains(&(kind, name.clone())) {
            return Err(ClusterError::Rejected {
                kind,
                name,
                message: "rejected by test store".to_string(),
            });
        }

        let mut resources = self.resources.write().await;
        let key = (kind, namespace.to_string(), name.clone());
        if resources.contains_key(&key) {
            return Err(ClusterError::Rejected {
                kind,
                name,
                message: "already exists".to_string(),
            });
        }
        resources.insert(key, manifest.clone());
        Ok(Some(manifest.clone()))
    }
}

#[async_trait]
impl ClusterConnector for Arc<MemoryCluster> {
    async fn connect(&self, _kubeconfig: &Path) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyde_reconcile::Reconciler;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_replaces_existing_manifest() {
        let cluster = MemoryCluster::new();
        let reconciler = Reconciler::default();

        for replicas in [1, 3] {
            let manifest = json!({
                "metadata": {"name": "web-deployment"},
                "spec": {"replicas": replicas}
            });
            let ops = ClusterResource::new(
                &cluster,
                ResourceKind::Deployment,
                DEFAULT_NAMESPACE,
                manifest,
            );
            reconciler.create_or_replace("web-deployment", &ops).await.unwrap();
        }

        let stored = cluster
            .get(ResourceKind::Deployment, DEFAULT_NAMESPACE, "web-deployment")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["spec"]["replicas"], 3);
        assert_eq!(cluster.len().await, 1);
    }

    #[tokio::test]
    async fn test_failing_create_is_rejected() {
        let cluster = MemoryCluster::new().failing_for(ResourceKind::Service, "mysql0");
        let err = cluster
            .create(
                ResourceKind::Service,
                DEFAULT_NAMESPACE,
                &json!({"metadata": {"name": "mysql0"}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Rejected { .. }));
        assert!(cluster.is_empty().await);
    }

    #[test]
    fn test_api_resources() {
        let secret = ResourceKind::Secret.api_resource();
        assert_eq!(secret.api_version, "v1");
        assert_eq!(secret.plural, "secrets");

        let deployment = ResourceKind::Deployment.api_resource();
        assert_eq!(deployment.api_version, "apps/v1");
        assert_eq!(deployment.group, "apps");

        let ceph = ResourceKind::CephCluster.api_resource();
        assert_eq!(ceph.api_version, "ceph.rook.io/v1");
        assert_eq!(ceph.kind, "CephCluster");

        assert!(!ResourceKind::ClusterRoleBinding.is_namespaced());
        assert!(ResourceKind::Ingress.is_namespaced());
    }

    fn kube_client(server: &MockServer) -> KubeClient {
        let config = Config::new(server.uri().parse().unwrap());
        KubeClient::new(Client::try_from(config).unwrap())
    }

    fn not_found(name: &str) -> ResponseTemplate {
        ResponseTemplate::new(404).set_body_json(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("secrets \"{name}\" not found"),
            "reason": "NotFound",
            "code": 404
        }))
    }

    fn secret(name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"password": "aHVudGVyMg=="}
        })
    }

    #[tokio::test]
    async fn test_kube_get_maps_404_to_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/secrets/missing"))
            .respond_with(not_found("missing"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/default/deployments/web-deployment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web-deployment", "namespace": "default"},
                "spec": {"replicas": 2}
            })))
            .mount(&server)
            .await;

        let client = kube_client(&server);
        let missing = client
            .get(ResourceKind::Secret, DEFAULT_NAMESPACE, "missing")
            .await
            .unwrap();
        assert!(missing.is_none());

        let found = client
            .get(ResourceKind::Deployment, DEFAULT_NAMESPACE, "web-deployment")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["spec"]["replicas"], 2);
    }

    #[tokio::test]
    async fn test_kube_create_posts_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/secrets"))
            .and(body_partial_json(json!({"metadata": {"name": "mysql0-root-pw"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(secret("mysql0-root-pw")))
            .expect(1)
            .mount(&server)
            .await;

        let created = kube_client(&server)
            .create(
                ResourceKind::Secret,
                DEFAULT_NAMESPACE,
                &json!({"metadata": {"name": "mysql0-root-pw"}, "data": {}}),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created["metadata"]["name"], "mysql0-root-pw");
    }

    #[tokio::test]
    async fn test_kube_delete_of_missing_resource_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/namespaces/default/secrets/gone"))
            .respond_with(not_found("gone"))
            .expect(1)
            .mount(&server)
            .await;

        kube_client(&server)
            .delete(ResourceKind::Secret, DEFAULT_NAMESPACE, "gone")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_kube_server_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephclusters/rook-ceph"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "forbidden",
                "reason": "Forbidden",
                "code": 403
            })))
            .mount(&server)
            .await;

        let err = kube_client(&server)
            .get(ResourceKind::CephCluster, "rook-ceph", "rook-ceph")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Api(kube::Error::Api(ref e)) if e.code == 403));
    }

    #[tokio::test]
    async fn test_unreadable_kubeconfig_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = KubeConnector::new(Duration::from_secs(5))
            .connect(&dir.path().join("config"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Kubeconfig { .. }));
    }
}
