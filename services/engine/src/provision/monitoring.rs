//! Cluster state metrics exporter.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use super::cluster::{ResourceKind, DEFAULT_NAMESPACE};
use super::inventory::Inventory;
use super::platform::{require_kubernetes, InstallBatch};
use super::{Product, ProvisionError, Provisioner, ProvisionerRegistry};
use crate::model::{Infrastructure, Parameters};

const NAME: &str = "kube-state-metrics";
const IMAGE: &str = "registry.k8s.io/kube-state-metrics/kube-state-metrics:v2.13.0";
const METRICS_PORT: u16 = 8080;
const TELEMETRY_PORT: u16 = 8081;

/// Resources the exporter lists and watches, by API group.
const WATCHED: &[(&str, &[&str])] = &[
    (
        "",
        &[
            "configmaps",
            "endpoints",
            "limitranges",
            "namespaces",
            "nodes",
            "persistentvolumeclaims",
            "persistentvolumes",
            "pods",
            "replicationcontrollers",
            "resourcequotas",
            "secrets",
            "services",
        ],
    ),
    ("apps", &["daemonsets", "deployments", "replicasets", "statefulsets"]),
    ("batch", &["cronjobs", "jobs"]),
    ("networking.k8s.io", &["ingresses"]),
    ("storage.k8s.io", &["storageclasses"]),
];

fn metadata(namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(NAME.to_string()),
        namespace: namespace.map(str::to_string),
        ..ObjectMeta::default()
    }
}

fn manifest<T: Serialize>(resource: &T) -> Result<Value, ProvisionError> {
    serde_json::to_value(resource).map_err(|source| ProvisionError::Config {
        product: NAME.to_string(),
        source,
    })
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(Some(DEFAULT_NAMESPACE)),
        ..ServiceAccount::default()
    }
}

fn cluster_role() -> ClusterRole {
    let rules = WATCHED
        .iter()
        .map(|(group, resources)| PolicyRule {
            api_groups: Some(vec![group.to_string()]),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            verbs: vec!["list".to_string(), "watch".to_string()],
            ..PolicyRule::default()
        })
        .collect();
    ClusterRole {
        metadata: metadata(None),
        rules: Some(rules),
        ..ClusterRole::default()
    }
}

fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: metadata(None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: NAME.to_string(),
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            ..Subject::default()
        }]),
    }
}

fn deployment(image: &str) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": NAME, "labels": {"app": NAME}},
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": NAME}},
            "template": {
                "metadata": {"labels": {"app": NAME}},
                "spec": {
                    "serviceAccountName": NAME,
                    "containers": [{
                        "name": NAME,
                        "image": image,
                        "ports": [
                            {"name": "http-metrics", "containerPort": METRICS_PORT},
                            {"name": "telemetry", "containerPort": TELEMETRY_PORT},
                        ],
                    }],
                },
            },
        },
    })
}

fn service() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": NAME, "labels": {"app": NAME}},
        "spec": {
            "type": "ClusterIP",
            "selector": {"app": NAME},
            "ports": [
                {"name": "http-metrics", "port": METRICS_PORT, "targetPort": "http-metrics"},
                {"name": "telemetry", "port": TELEMETRY_PORT, "targetPort": "telemetry"},
            ],
        },
    })
}

/// Installs the exporter from plain manifests: its account and cluster-wide
/// read access, then the workload and its service.
pub struct KubeStateMetricsProvisioner;

impl KubeStateMetricsProvisioner {
    async fn install(
        &self,
        batch: &mut InstallBatch<'_>,
        image: &str,
    ) -> Result<(), ProvisionError> {
        batch
            .apply(ResourceKind::ServiceAccount, NAME, manifest(&service_account())?)
            .await?;
        batch
            .apply_in(ResourceKind::ClusterRole, "", NAME, manifest(&cluster_role())?)
            .await?;
        batch
            .apply_in(
                ResourceKind::ClusterRoleBinding,
                "",
                NAME,
                manifest(&cluster_role_binding())?,
            )
            .await?;
        batch
            .apply(ResourceKind::Deployment, NAME, deployment(image))
            .await?;
        batch.apply(ResourceKind::Service, NAME, service()).await?;
        Ok(())
    }
}

#[async_trait]
impl Provisioner for KubeStateMetricsProvisioner {
    fn product(&self) -> Product {
        Product::KubeStateMetrics
    }

    fn requires_ssh(&self, _args: &Parameters) -> bool {
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
        let image = args.get("image").unwrap_or(IMAGE);
        info!(image = %image, "Deploying metrics exporter");

        let client = registry.cluster(&config).await?;
        let mut batch = InstallBatch::new(client.as_ref(), registry.reconciler(), registry.vault());
        if let Err(e) = self.install(&mut batch, image).await {
            error!(error = %e, "Error deploying metrics exporter, rolling back");
            batch.rollback(&mut config).await;
            return Err(e);
        }

        Ok(Parameters::new().with(
            "endpoint",
            format!("{NAME}.{DEFAULT_NAMESPACE}.svc:{METRICS_PORT}"),
        ))
    }
}
