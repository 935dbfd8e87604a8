//! Edge router in front of the cluster's services.
//!
//! The first install brings the router up and exposes its entrypoints on
//! node ports. Later installs with `mode=redirect` route a path prefix on
//! one entrypoint to an existing service.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use super::cluster::ResourceKind;
use super::executor::ExtraVars;
use super::inventory::Inventory;
use super::platform::{parsed, require_kubernetes, required, InstallBatch};
use super::{
    KubernetesConfig, Product, ProductConfig, ProvisionError, Provisioner, ProvisionerRegistry,
};
use crate::model::{Infrastructure, Parameters};

const SERVICE: &str = "traefik";
const APP_LABEL: &str = "app";
const REDIRECT_MODE: &str = "redirect";
const ENTRYPOINT_ANNOTATION: &str = "traefik.ingress.kubernetes.io/router.entrypoints";

/// Entrypoint name and the container port it listens on.
const WEB: (&str, u16) = ("web", 8000);
const SECURE: (&str, u16) = ("secure", 4443);
const ADMIN: (&str, u16) = ("admin", 8080);

/// Node port of every exposed entrypoint, and the redirects routed so far
/// (ingress name to path prefix).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraefikConfig {
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub redirects: BTreeMap<String, String>,
}

impl ProductConfig for TraefikConfig {
    const KEY: &'static str = "traefik";
}

fn is_redirect(args: &Parameters) -> bool {
    args.get("mode") == Some(REDIRECT_MODE)
}

fn router_service(ports: &[((&str, u16), u16)]) -> Value {
    let ports: Vec<Value> = ports
        .iter()
        .map(|((name, target), port)| {
            json!({
                "name": name,
                "port": port,
                "nodePort": port,
                "targetPort": target,
            })
        })
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": SERVICE},
        "spec": {
            "type": "NodePort",
            "selector": {APP_LABEL: SERVICE},
            "ports": ports,
        },
    })
}

/// Route from a path prefix on one entrypoint to a service.
struct Redirect {
    prefix: String,
    service: String,
    port: u16,
    entrypoint: String,
    namespace: String,
}

impl Redirect {
    fn from_args(args: &Parameters) -> Result<Self, ProvisionError> {
        let product = Product::Traefik;
        let entrypoint = args.get("traefik_port").unwrap_or(WEB.0);
        if entrypoint != WEB.0 && entrypoint != SECURE.0 {
            return Err(ProvisionError::InvalidArgument {
                product,
                argument: "traefik_port",
                reason: format!("expected {} or {}, got {entrypoint}", WEB.0, SECURE.0),
            });
        }
        Ok(Self {
            prefix: required(product, args, "prefix")?.to_string(),
            service: required(product, args, "service")?.to_string(),
            port: parsed(product, required(product, args, "port")?, "port")?,
            entrypoint: entrypoint.to_string(),
            namespace: args.get("svc_namespace").unwrap_or("default").to_string(),
        })
    }

    fn name(&self) -> String {
        format!("{}-{}", self.service, self.entrypoint)
    }

    fn manifest(&self) -> Value {
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "name": self.name(),
                "namespace": self.namespace,
                "annotations": {ENTRYPOINT_ANNOTATION: self.entrypoint},
            },
            "spec": {
                "ingressClassName": SERVICE,
                "rules": [{
                    "http": {
                        "paths": [{
                            "path": self.prefix,
                            "pathType": "Prefix",
                            "backend": {
                                "service": {
                                    "name": self.service,
                                    "port": {"number": self.port},
                                },
                            },
                        }],
                    },
                }],
            },
        })
    }
}

pub struct TraefikProvisioner;

impl TraefikProvisioner {
    /// Allocates a node port per entrypoint and exposes them in one service.
    async fn expose(
        &self,
        registry: &ProvisionerRegistry,
        batch: &mut InstallBatch<'_>,
        config: &mut KubernetesConfig,
        expose_admin: bool,
    ) -> Result<TraefikConfig, ProvisionError> {
        let range = registry.settings().port_range;
        let mut entrypoints = vec![WEB, SECURE];
        if expose_admin {
            entrypoints.push(ADMIN);
        }

        let mut ports = Vec::with_capacity(entrypoints.len());
        for entrypoint in entrypoints {
            ports.push((entrypoint, batch.allocate_port(config, range)?));
        }
        batch
            .apply(ResourceKind::Service, SERVICE, router_service(&ports))
            .await?;

        Ok(TraefikConfig {
            ports: ports
                .into_iter()
                .map(|((name, _), port)| (name.to_string(), port))
                .collect(),
            redirects: BTreeMap::new(),
        })
    }

    async fn deploy(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        infra: &mut Infrastructure,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        let mut config = require_kubernetes(self.product(), infra)?;
        let expose_admin = args.get_bool_or("expose_admin", false);

        registry
            .run_playbook("kubernetes/traefik/main.yml", Some(inventory), &ExtraVars::new())
            .await?;

        let client = registry.cluster(&config).await?;
        let mut batch = InstallBatch::new(client.as_ref(), registry.reconciler(), registry.vault());
        let traefik = match self.expose(registry, &mut batch, &mut config, expose_admin).await {
            Ok(traefik) => traefik,
            Err(e) => {
                error!(error = %e, "Error exposing router, rolling back");
                batch.rollback(&mut config).await;
                return Err(e);
            }
        };
        info!(ports = ?traefik.ports, "Router exposed");

        let mut result = Parameters::new();
        let outputs = [
            (WEB.0, "http_port"),
            (SECURE.0, "ssl_port"),
            (ADMIN.0, "admin_port"),
        ];
        for (entrypoint, key) in outputs {
            if let Some(port) = traefik.ports.get(entrypoint) {
                result.insert(key, port.to_string());
            }
        }

        traefik.store(&mut config.deployments)?;
        config.store(&mut infra.products)?;
        Ok(result)
    }

    async fn redirect(
        &self,
        registry: &ProvisionerRegistry,
        infra: &mut Infrastructure,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        let mut config = require_kubernetes(self.product(), infra)?;
        let mut traefik = TraefikConfig::load(&config.deployments)?.ok_or_else(|| {
            ProvisionError::precondition(
                self.product(),
                format!("traefik is not installed in infrastructure {}", infra.id),
            )
        })?;
        let redirect = Redirect::from_args(args)?;
        let name = redirect.name();
        if traefik.redirects.contains_key(&name) {
            return Err(ProvisionError::AlreadyExists {
                product: self.product(),
                name,
            });
        }

        info!(ingress = %name, prefix = %redirect.prefix, "Routing prefix");
        let client = registry.cluster(&config).await?;
        let mut batch = InstallBatch::new(client.as_ref(), registry.reconciler(), registry.vault());
        if let Err(e) = batch
            .apply_in(ResourceKind::Ingress, &redirect.namespace, &name, redirect.manifest())
            .await
        {
            batch.rollback(&mut config).await;
            return Err(e);
        }

        traefik.redirects.insert(name.clone(), redirect.prefix);
        traefik.store(&mut config.deployments)?;
        config.store(&mut infra.products)?;
        Ok(Parameters::new().with("ingress", name))
    }
}

#[async_trait]
impl Provisioner for TraefikProvisioner {
    fn product(&self) -> Product {
        Product::Traefik
    }

    fn requires_ssh(&self, args: &Parameters) -> bool {
        !is_redirect(args)
    }

    fn installs_once(&self, args: &Parameters) -> bool {
        !is_redirect(args)
    }

    fn build_inventory(
        &self,
        registry: &ProvisionerRegistry,
        infra: &Infrastructure,
        args: &Parameters,
    ) -> Result<Inventory, ProvisionError> {
        if is_redirect(args) {
            return Ok(Inventory::default());
        }
        registry.build_inventory(Product::Kubeadm, infra, args)
    }

    #[instrument(skip_all, fields(infrastructure = %infra.id))]
    async fn deploy_product(
        &self,
        registry: &ProvisionerRegistry,
        inventory: &Path,
        infra: &mut Infrastructure,
        args: &Parameters,
    ) -> Result<Parameters, ProvisionError> {
        if is_redirect(args) {
            self.redirect(registry, infra, args).await
        } else {
            self.deploy(registry, inventory, infra, args).await
        }
    }
}
