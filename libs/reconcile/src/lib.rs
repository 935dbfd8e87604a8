//! Create-or-replace reconciliation against external resource stores.
//!
//! The engine never patches resources it manages on a target platform.
//! Every managed object (workload, service endpoint, config bundle, secret,
//! volume claim, stateful workload) is reconciled the same way:
//!
//! 1. `get` the resource by name.
//! 2. If it exists, `delete` it and poll `get` until it is gone.
//! 3. `create` it fresh.
//!
//! # Invariants
//!
//! - `create` is never called while a deletion is unconfirmed; a deletion
//!   that outlives its deadline fails the whole operation.
//! - A `create` that reports success without returning a resource is an
//!   error, not a success.

pub mod poll;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use poll::{wait_for_status_change, PollConfig, PollError, DEFAULT_POLL_INTERVAL};

/// Reference deadline for confirming a resource deletion.
pub const DEFAULT_DELETION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Reconciliation errors, generic over the store's own error type.
#[derive(Debug, Error)]
pub enum ReconcileError<E: std::error::Error + 'static> {
    /// The store rejected a get, delete or create.
    #[error("resource {resource}: {source}")]
    Remote {
        resource: String,
        #[source]
        source: E,
    },

    /// The old resource was still present when the deadline passed.
    #[error("timeout after {elapsed:?} waiting for {resource} to be deleted")]
    DeletionTimeout { resource: String, elapsed: Duration },

    /// Create returned without error but also without a resource.
    #[error("resource {0} accepted but not materialized")]
    NotMaterialized(String),
}

impl<E: std::error::Error + 'static> ReconcileError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeletionTimeout { .. })
    }
}

/// The three store operations the reconcile protocol needs.
///
/// Implementations map "not found" to `Ok(None)` in [`ResourceOps::get`].
#[async_trait]
pub trait ResourceOps: Send + Sync {
    type Resource: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, name: &str) -> Result<Option<Self::Resource>, Self::Error>;

    async fn delete(&self, name: &str) -> Result<(), Self::Error>;

    async fn create(&self) -> Result<Option<Self::Resource>, Self::Error>;
}

/// Runs the create-or-replace protocol.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    deletion: PollConfig,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(PollConfig::with_timeout(DEFAULT_DELETION_TIMEOUT))
    }
}

impl Reconciler {
    pub fn new(deletion: PollConfig) -> Self {
        Self { deletion }
    }

    /// Produces a freshly created resource named `name`, replacing any
    /// existing one.
    #[instrument(skip(self, ops), fields(resource = %name))]
    pub async fn create_or_replace<O>(
        &self,
        name: &str,
        ops: &O,
    ) -> Result<O::Resource, ReconcileError<O::Error>>
    where
        O: ResourceOps + ?Sized,
    {
        let remote = |source| ReconcileError::Remote {
            resource: name.to_owned(),
            source,
        };

        if ops.get(name).await.map_err(remote)?.is_some() {
            info!("Replacing existing resource");
            ops.delete(name).await.map_err(remote)?;

            let gone = wait_for_status_change(&true, &self.deletion, move || async move {
                ops.get(name).await.map(|found| found.is_some())
            })
            .await;

            match gone {
                Ok(_) => debug!("Deletion confirmed"),
                Err(PollError::Timeout { elapsed, .. }) => {
                    return Err(ReconcileError::DeletionTimeout {
                        resource: name.to_owned(),
                        elapsed,
                    })
                }
                Err(PollError::Remote(source)) => return Err(remote(source)),
            }
        }

        match ops.create().await.map_err(remote)? {
            Some(resource) => {
                debug!("Resource created");
                Ok(resource)
            }
            None => Err(ReconcileError::NotMaterialized(name.to_owned())),
        }
    }
}
