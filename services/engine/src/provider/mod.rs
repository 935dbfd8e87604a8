//! Compute providers.
//!
//! A [`ProviderAdapter`] creates and destroys single compute nodes on one
//! cloud. The orchestrator fans node work out across an adapter; the
//! adapter owns the per-node sequence and its own cleanup.

pub mod client;
mod stub;
mod vm;

pub use client::{HttpVmClient, VmApi, VmApiError};
pub use stub::StubProvider;
pub use vm::VmProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyde_id::SecretId;
use hyde_networking::NetworkError;
use hyde_reconcile::{PollConfig, PollError, DEFAULT_POLL_INTERVAL};
use thiserror::Error;
use tracing::info;

use crate::db::DbError;
use crate::model::{Node, ProviderRef, ResourceSpec};
use crate::secrets::Vault;

/// Provider type backed by the VM REST API.
pub const VM_PROVIDER_TYPE: &str = "cloudsigma";

/// Synthetic provider, available in development mode only.
pub const STUB_PROVIDER_TYPE: &str = "stub";

/// Login user for VM-API nodes.
pub const DEFAULT_VM_USERNAME: &str = "cloudsigma";

/// Provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Infrastructure plus resource name is not a usable hostname.
    #[error("invalid node name: {0}")]
    InvalidHostname(#[from] NetworkError),

    /// The VM API call failed.
    #[error(transparent)]
    Api(#[from] VmApiError),

    /// A wait ran out of time.
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// A wait ended in the wrong status.
    #[error("{what} is {actual}, expected {expected}")]
    UnexpectedStatus {
        what: String,
        expected: &'static str,
        actual: String,
    },

    /// A server action did not report success.
    #[error("{action} action on {server} returned {result}")]
    ActionFailed {
        server: String,
        action: &'static str,
        result: String,
    },

    /// The API accepted a create call but returned nothing usable.
    #[error("{0} was not created")]
    NotMaterialized(String),

    /// A size in MB does not fit the API's byte fields.
    #[error("{what} of {megabytes} MB is too large")]
    SizeOverflow { what: String, megabytes: u64 },

    /// The free address pool is smaller than the node count.
    #[error("not enough free addresses: needed {needed}, found {available}")]
    NotEnoughAddresses { needed: usize, available: usize },

    /// The provider secret lacks username or password.
    #[error("secret {0} does not hold basic credentials")]
    MissingCredentials(SecretId),

    /// No adapter for this provider type.
    #[error("unsupported provider type: {0}")]
    UnsupportedProvider(String),

    /// Reading credentials failed.
    #[error(transparent)]
    Vault(#[from] DbError),

    /// Failure reported by a synthetic provider.
    #[error("{0}")]
    Remote(String),
}

impl ProviderError {
    /// Maps a failed status wait on `what`.
    pub(crate) fn from_poll(what: impl Into<String>, err: PollError<String, VmApiError>) -> Self {
        match err {
            PollError::Timeout { elapsed, .. } => Self::Timeout {
                what: what.into(),
                elapsed,
            },
            PollError::Remote(e) => Self::Api(e),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A node that could not be created.
///
/// `cleanup` holds the errors hit while deleting what the attempt had
/// already created; they never replace `source`.
#[derive(Debug, Error)]
#[error("node {hostname}: {source}")]
pub struct NodeFailure {
    pub hostname: String,
    #[source]
    pub source: ProviderError,
    pub cleanup: Vec<ProviderError>,
}

impl NodeFailure {
    pub fn new(hostname: impl Into<String>, source: ProviderError) -> Self {
        Self {
            hostname: hostname.into(),
            source,
            cleanup: Vec::new(),
        }
    }
}

/// One node to create.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub infra_name: String,
    pub resource: ResourceSpec,
    pub address: String,
}

impl NodeRequest {
    /// Unsanitized hostname, used to label failures before validation.
    pub fn raw_hostname(&self) -> String {
        format!("{}-{}", self.infra_name, self.resource.name)
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Up to `count` unassigned addresses. Fewer is not an error here.
    async fn free_addresses(&self, count: usize) -> Result<Vec<String>, ProviderError>;

    /// Creates a node. On failure, everything the attempt created has been
    /// deleted, or the deletion errors are attached.
    async fn create_node(&self, request: NodeRequest) -> Result<Node, NodeFailure>;

    async fn delete_node(&self, node: &Node) -> Result<(), ProviderError>;
}

/// Waits used by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTimeouts {
    pub poll_interval: Duration,
    pub disk: Duration,
    pub boot: Duration,
    pub stop: Duration,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            disk: Duration::from_secs(60),
            boot: Duration::from_secs(120),
            stop: Duration::from_secs(60),
        }
    }
}

impl ProviderTimeouts {
    pub fn disk_ready(&self) -> PollConfig {
        PollConfig::new(self.poll_interval, self.disk)
    }

    pub fn boot(&self) -> PollConfig {
        PollConfig::new(self.poll_interval, self.boot)
    }

    pub fn stop(&self) -> PollConfig {
        PollConfig::new(self.poll_interval, self.stop)
    }
}

/// Picks the adapter for an infrastructure's provider.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(&self, provider: &ProviderRef) -> Result<Arc<dyn ProviderAdapter>, ProviderError>;
}

/// Resolves `cloudsigma` to a [`VmProvider`] over HTTP, with credentials
/// read from the vault, and `stub` to a [`StubProvider`] in dev mode.
pub struct DefaultProviderResolver {
    vault: Arc<dyn Vault>,
    timeouts: ProviderTimeouts,
    username: String,
    dev_mode: bool,
}

impl DefaultProviderResolver {
    pub fn new(
        vault: Arc<dyn Vault>,
        timeouts: ProviderTimeouts,
        username: impl Into<String>,
        dev_mode: bool,
    ) -> Self {
        Self {
            vault,
            timeouts,
            username: username.into(),
            dev_mode,
        }
    }
}

#[async_trait]
impl ProviderResolver for DefaultProviderResolver {
    async fn resolve(&self, provider: &ProviderRef) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        match provider.api_type.as_str() {
            VM_PROVIDER_TYPE => {
                let secret = self.vault.get_secret(&provider.secret_id).await?;
                let (username, password) = secret
                    .as_basic_auth()
                    .ok_or(ProviderError::MissingCredentials(provider.secret_id))?;
                let client = HttpVmClient::new(&provider.api_endpoint, username, password)?;

                info!(endpoint = %provider.api_endpoint, "Resolved VM provider");
                Ok(Arc::new(VmProvider::new(
                    client,
                    self.username.clone(),
                    self.timeouts,
                )))
            }
            STUB_PROVIDER_TYPE if self.dev_mode => Ok(Arc::new(StubProvider::new())),
            other => Err(ProviderError::UnsupportedProvider(other.to_string())),
        }
    }
}
