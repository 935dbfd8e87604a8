//! Playbook-only products.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use super::executor::ExtraVars;
use super::inventory::Inventory;
use super::platform::require_kubernetes;
use super::{
    Product, ProductConfig, ProvisionError, Provisioner, ProvisionerRegistry, WAIT_FOR_SSH,
};
use crate::model::{Infrastructure, Parameters};

/// Registers every node in every other node's hosts file.
pub struct HostsProvisioner;

#[async_trait]
impl Provisioner for HostsProvisioner {
    fn product(&self) -> Product {
        Product::Hosts
    }

    fn build_inventory(
        &self,
        _registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        _args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        Ok(Inventory::default_all(infra))
    }

    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        _infra: &mut Infrastructure,
        _args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        registry
            .run_playbook("common/add_hostname.yml", Some(inventory), &ExtraVars::new())
            .await?;
        Ok(Parameters::new())
    }
}

pub struct DockerProvisioner;

#[async_trait]
impl Provisioner for DockerProvisioner {
    fn product(&self) -> Product {
        Product::Docker
    }

    fn build_inventory(
        &self,
        _registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        _args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        Ok(Inventory::default_all(infra))
    }

    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        _infra: &mut Infrastructure,
        _args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        registry
            .run_playbook("docker/main.yml", Some(inventory), &ExtraVars::new())
            .await?;
        Ok(Parameters::new())
    }
}

/// Package manager for the cluster.
pub struct HelmProvisioner;

#[async_trait]
impl Provisioner for HelmProvisioner {
    fn product(&self) -> Product {
        Product::Helm
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
        registry
            .run_playbook("kubernetes/helm/main.yml", Some(inventory), &ExtraVars::new())
            .await?;
        Ok(Parameters::new())
    }
}

/// Log shipping through a helm chart. Dotted arguments (`a.b=c`) become
/// the chart's nested values.
pub struct LoggingProvisioner;

#[async_trait]
impl Provisioner for LoggingProvisioner {
    fn product(&self) -> Product {
        Product::Logging
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
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        require_kubernetes(self.product(), infra)?;
        if !infra.has_product(Product::Helm.name()) {
            return Err(ProvisionError::precondition(
                self.product(),
                format!("helm is not installed in infrastructure {}", infra.id),
            ));
        }

        let values = chart_values(args);
        info!(keys = values.len(), "Deploying log shipper");
        let vars = ExtraVars::from([("values".to_string(), Value::Object(values))]);
        registry
            .run_playbook("kubernetes/fluentd/main.yml", Some(inventory), &vars)
            .await?;
        Ok(Parameters::new())
    }
}

/// Cluster secret holding the credentials of every configured registry.
pub const REGISTRIES_SECRET: &str = "docker-registries";

/// Private image registry access for every node and workload. Each install
/// adds one registry; the shared pull secret is rebuilt every time.
pub struct RegistryProvisioner;

#[async_trait]
impl Provisioner for RegistryProvisioner {
    fn product(&self) -> Product {
        Product::Registry
    }

    fn installs_once(&self, _args: &Parameters) -> bool {
        false
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
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        let mut config = require_kubernetes(self.product(), infra)?;

        let mut vars = ExtraVars::new();
        for (argument, var) in [
            ("name", "repo_name"),
            ("username", "repo_username"),
            ("password", "repo_password"),
        ] {
            let value = args
                .get(argument)
                .ok_or_else(|| ProvisionError::missing(self.product(), argument))?;
            vars.insert(var.to_string(), Value::from(value));
        }
        if let Some(cert) = args.get("cert_file") {
            vars.insert("cert_file".to_string(), Value::from(cert));
        }

        info!(registry = ?vars.get("repo_name"), "Configuring image registry");
        registry
            .run_playbook("kubernetes/docker_repository.yml", Some(inventory), &vars)
            .await?;
        let secret_vars = ExtraVars::from([(
            "secret_name".to_string(),
            Value::from(REGISTRIES_SECRET),
        )]);
        registry
            .run_playbook(
                "kubernetes/docker_repository_secret.yml",
                Some(inventory),
                &secret_vars,
            )
            .await?;

        config.registries_secret = Some(REGISTRIES_SECRET.to_string());
        config.store(&mut infra.products)?;
        Ok(Parameters::new().with("secret", REGISTRIES_SECRET))
    }
}

/// Nests dotted argument keys into a values document.
fn chart_values(args: &Parameters) -> Map<String, Value> {
    let mut values = Map::new();
    for (key, value) in args.iter().filter(|(k, _)| *k != WAIT_FOR_SSH) {
        let path: Vec<&str> = key.split('.').collect();
        insert_path(&mut values, &path, value);
    }
    values
}

fn insert_path(values: &mut Map<String, Value>, path: &[&str], value: &str) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        values.insert(head.to_string(), Value::String(value.to_string()));
        return;
    }

    let entry = values
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(inner) = entry {
        insert_path(inner, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::testing::Harness;
    use crate::provision::KubernetesConfig;
    use serde_json::json;

    #[test]
    fn test_dotted_arguments_nest() {
        let args = Parameters::new()
            .with("elasticsearch.host", "es.local")
            .with("elasticsearch.port", "9200")
            .with("image.tag", "v1")
            .with("replicas", "2")
            .with(WAIT_FOR_SSH, "false");

        assert_eq!(
            Value::Object(chart_values(&args)),
            json!({
                "elasticsearch": {"host": "es.local", "port": "9200"},
                "image": {"tag": "v1"},
                "replicas": "2"
            })
        );
    }

    #[tokio::test]
    async fn test_logging_requires_helm() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 1);
        KubernetesConfig::new("/tmp/config")
            .store(&mut infra.products)
            .unwrap();

        let err = harness
            .registry
            .provision(&mut infra, Product::Logging, &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Precondition { product: Product::Logging, .. }));
    }

    #[tokio::test]
    async fn test_logging_passes_values() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 1);
        KubernetesConfig::new("/tmp/config")
            .store(&mut infra.products)
            .unwrap();
        infra.products.insert("helm".into(), json!({}));

        harness
            .registry
            .provision(
                &mut infra,
                Product::Logging,
                &Parameters::new().with("output.host", "es"),
            )
            .await
            .unwrap();

        let runs = harness.executor.runs().await;
        let last = runs.last().unwrap();
        assert!(last.playbook.ends_with("kubernetes/fluentd/main.yml"));
        assert_eq!(last.vars["values"], json!({"output": {"host": "es"}}));
    }

    fn registry_args() -> Parameters {
        Parameters::new()
            .with("name", "registry.example.com")
            .with("username", "deployer")
            .with("password", "s3cret")
    }

    #[tokio::test]
    async fn test_registry_sets_pull_secret() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 1);
        KubernetesConfig::new("/tmp/config")
            .store(&mut infra.products)
            .unwrap();

        let result = harness
            .registry
            .provision(
                &mut infra,
                Product::Registry,
                &registry_args().with("cert_file", "/etc/ca.pem"),
            )
            .await
            .unwrap();
        assert_eq!(result.get("secret"), Some(REGISTRIES_SECRET));

        assert_eq!(
            harness.playbooks().await,
            vec![
                "common/wait_for_ssh.yml",
                "kubernetes/docker_repository.yml",
                "kubernetes/docker_repository_secret.yml",
            ]
        );
        let runs = harness.executor.runs().await;
        assert_eq!(runs[1].vars["repo_name"], "registry.example.com");
        assert_eq!(runs[1].vars["cert_file"], "/etc/ca.pem");
        assert_eq!(runs[2].vars["secret_name"], REGISTRIES_SECRET);

        let config = KubernetesConfig::load(&infra.products).unwrap().unwrap();
        assert_eq!(config.registries_secret.as_deref(), Some(REGISTRIES_SECRET));
    }

    #[tokio::test]
    async fn test_registry_requires_credentials() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 0);
        KubernetesConfig::new("/tmp/config")
            .store(&mut infra.products)
            .unwrap();
        let args: Parameters = registry_args()
            .iter()
            .filter(|(k, _)| *k != "password")
            .collect();

        let err = harness
            .registry
            .provision(&mut infra, Product::Registry, &args)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::MissingArgument { argument: "password", .. }));
    }

    #[tokio::test]
    async fn test_helm_needs_cluster() {
        let harness = Harness::new();
        let mut infra = harness.infrastructure(1, 0);

        let err = harness
            .registry
            .provision(&mut infra, Product::Helm, &Parameters::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kubernetes is not installed"));
    }
}
