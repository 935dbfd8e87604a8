//! Concurrent node and infrastructure fan-out.
//!
//! Every unit of work runs as its own task and posts exactly one outcome to
//! a queue sized to the number of tasks. The orchestrator drains the queue
//! to completion even after failures, so each task's own cleanup always
//! finishes before the aggregate is reported.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::model::{Infrastructure, InfrastructureSpec, InfrastructureStatus, ProviderRef};
use crate::provider::{
    NodeFailure, NodeRequest, ProviderAdapter, ProviderError, ProviderResolver,
};

/// Outcome of deploying one infrastructure.
///
/// The infrastructure holds every node that was created; `failures` the
/// ones that were not. Tearing down survivors is left to the caller.
#[derive(Debug)]
pub struct InfrastructureReport {
    pub infrastructure: Infrastructure,
    pub failures: Vec<NodeFailure>,
}

impl InfrastructureReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-infrastructure result of a deployment-level fan-out, in request
/// order. An `Err` means no record could be produced at all.
#[derive(Debug)]
pub struct InfrastructureOutcome {
    pub name: String,
    pub result: Result<InfrastructureReport, ProviderError>,
}

/// Fans node creation and deletion out across provider adapters.
#[derive(Clone)]
pub struct InfrastructureOrchestrator {
    resolver: Arc<dyn ProviderResolver>,
}

impl InfrastructureOrchestrator {
    pub fn new(resolver: Arc<dyn ProviderResolver>) -> Self {
        Self { resolver }
    }

    /// Deploys every infrastructure concurrently, one task each.
    #[instrument(skip_all, fields(infrastructures = infrastructures.len()))]
    pub async fn deploy_all(
        &self,
        infrastructures: Vec<(InfrastructureSpec, ProviderRef)>,
    ) -> Vec<InfrastructureOutcome> {
        let expected = infrastructures.len();
        let names: Vec<String> = infrastructures.iter().map(|(s, _)| s.name.clone()).collect();
        let (tx, mut rx) = mpsc::channel(expected.max(1));

        for (index, (spec, provider_ref)) in infrastructures.into_iter().enumerate() {
            let tx = tx.clone();
            let resolver = self.resolver.clone();
            tokio::spawn(async move {
                let result = match resolver.resolve(&provider_ref).await {
                    Ok(provider) => deploy(provider, &spec, provider_ref).await,
                    Err(e) => {
                        error!(infrastructure = %spec.name, error = %e, "Error resolving provider");
                        Err(e)
                    }
                };
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut results: BTreeMap<usize, Result<InfrastructureReport, ProviderError>> =
            BTreeMap::new();
        for _ in 0..expected {
            match rx.recv().await {
                Some((index, result)) => {
                    results.insert(index, result);
                }
                None => break,
            }
        }

        names
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                let result = results.remove(&index).unwrap_or_else(|| {
                    error!(infrastructure = %name, "Infrastructure task ended without reporting");
                    Err(ProviderError::Remote(format!(
                        "deployment task for {name} ended without reporting"
                    )))
                });
                InfrastructureOutcome { name, result }
            })
            .collect()
    }

    /// Resolves the infrastructure's provider and deletes all its nodes.
    pub async fn teardown_infrastructure(
        &self,
        infra: &Infrastructure,
    ) -> Result<BTreeMap<String, ProviderError>, ProviderError> {
        let provider = self.resolver.resolve(&infra.provider).await?;
        Ok(teardown(provider.as_ref(), infra).await)
    }
}

/// Creates every node of `spec` on `provider`.
///
/// Addresses are fetched up front, only for resources without a fixed
/// one; a short pool fails the infrastructure before any node work starts.
#[instrument(skip_all, fields(infrastructure = %spec.name, nodes = spec.resources.len()))]
pub async fn deploy(
    provider: Arc<dyn ProviderAdapter>,
    spec: &InfrastructureSpec,
    provider_ref: ProviderRef,
) -> Result<InfrastructureReport, ProviderError> {
    let needed = spec.resources.iter().filter(|r| r.ip.is_none()).count();
    let mut pool = if needed > 0 {
        provider.free_addresses(needed).await?
    } else {
        Vec::new()
    };
    if pool.len() < needed {
        error!(needed, available = pool.len(), "Not enough free addresses");
        return Err(ProviderError::NotEnoughAddresses {
            needed,
            available: pool.len(),
        });
    }
    pool.reverse();

    let requests: Vec<NodeRequest> = spec
        .resources
        .iter()
        .map(|resource| NodeRequest {
            infra_name: spec.name.clone(),
            address: resource.ip.clone().or_else(|| pool.pop()).unwrap_or_default(),
            resource: resource.clone(),
        })
        .collect();

    info!("Deploying infrastructure nodes");
    let mut infrastructure = Infrastructure::new(spec, provider_ref);
    let expected = requests.len();
    let labels: Vec<String> = requests.iter().map(NodeRequest::raw_hostname).collect();
    let (tx, mut rx) = mpsc::channel(expected.max(1));

    for (index, request) in requests.into_iter().enumerate() {
        let tx = tx.clone();
        let provider = provider.clone();
        tokio::spawn(async move {
            let outcome = provider.create_node(request).await;
            let _ = tx.send((index, outcome)).await;
        });
    }
    drop(tx);

    let mut reported = BTreeSet::new();
    let mut failures = Vec::new();
    for _ in 0..expected {
        let Some((index, outcome)) = rx.recv().await else {
            break;
        };
        reported.insert(index);
        match outcome {
            Ok(node) => infrastructure.add_node(node),
            Err(failure) => {
                error!(host = %failure.hostname, error = %failure.source, "Node creation failed");
                failures.push(failure);
            }
        }
    }

    for (index, label) in labels.into_iter().enumerate() {
        if !reported.contains(&index) {
            error!(host = %label, "Node task ended without reporting");
            failures.push(NodeFailure::new(
                label,
                ProviderError::Remote("node task ended without reporting".to_string()),
            ));
        }
    }

    infrastructure.status = if failures.is_empty() {
        info!("Nodes successfully created");
        InfrastructureStatus::Running
    } else {
        warn!(failed = failures.len(), "Infrastructure deployment failed");
        InfrastructureStatus::Failed
    };

    Ok(InfrastructureReport {
        infrastructure,
        failures,
    })
}

/// Deletes every node regardless of role. Best-effort: returns the errors
/// keyed by hostname.
#[instrument(skip_all, fields(infrastructure = %infra.id))]
pub async fn teardown(
    provider: &dyn ProviderAdapter,
    infra: &Infrastructure,
) -> BTreeMap<String, ProviderError> {
    info!(nodes = infra.node_count(), "Deleting infrastructure nodes");

    let mut errors = BTreeMap::new();
    for node in infra.all_nodes() {
        if let Err(e) = provider.delete_node(node).await {
            error!(host = %node.hostname, error = %e, "Error deleting node");
            errors.insert(node.hostname.clone(), e);
        }
    }

    if errors.is_empty() {
        info!("Nodes deleted, infrastructure clear");
    }
    errors
}
