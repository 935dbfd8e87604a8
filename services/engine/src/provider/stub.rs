//! Synthetic provider for development and tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hyde_networking::{sanitize_hostname, MAX_HOSTNAME_LEN};
use tracing::{debug, info};

use super::{NodeFailure, NodeRequest, ProviderAdapter, ProviderError};
use crate::model::{DriveInfo, Node};

/// Provider that fabricates nodes without touching any cloud.
pub struct StubProvider {
    /// Counter for generating instance ids and addresses.
    counter: AtomicU64,

    /// Nodes deleted so far.
    deleted: AtomicU64,

    /// Simulated creation latency.
    delay: Duration,

    /// Resource names whose creation fails.
    failing: BTreeSet<String>,

    /// Size of the free address pool; unlimited when `None`.
    pool: Option<usize>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            delay: Duration::from_millis(10),
            failing: BTreeSet::new(),
            pool: None,
        }
    }

    /// Fails creation of the named resources.
    pub fn failing_for<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: names.into_iter().map(Into::into).collect(),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Limits the number of free addresses.
    pub fn with_address_pool(mut self, size: usize) -> Self {
        self.pool = Some(size);
        self
    }

    pub fn created(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for StubProvider {
    async fn free_addresses(&self, count: usize) -> Result<Vec<String>, ProviderError> {
        let available = self.pool.map_or(count, |pool| pool.min(count));
        Ok((0..available)
            .map(|i| format!("10.0.{}.{}", i / 250, i % 250 + 2))
            .collect())
    }

    async fn create_node(&self, request: NodeRequest) -> Result<Node, NodeFailure> {
        let raw = request.raw_hostname();
        let hostname = sanitize_hostname(&raw, MAX_HOSTNAME_LEN)
            .map_err(|e| NodeFailure::new(raw, e.into()))?;

        tokio::time::sleep(self.delay).await;

        let resource = request.resource;
        if self.failing.contains(&resource.name) {
            return Err(NodeFailure::new(
                hostname,
                ProviderError::Remote(format!("stub configured to fail {}", resource.name)),
            ));
        }

        let id = self.next_id();
        info!(host = %hostname, ip = %request.address, "[STUB] Creating node");

        Ok(Node {
            hostname,
            role: resource.role.to_lowercase(),
            ip: request.address,
            username: "stub".to_string(),
            uuid: Some(format!("server_{id:016x}")),
            drive_uuid: Some(format!("drive_{id:016x}")),
            data_drives: resource
                .drives
                .iter()
                .enumerate()
                .map(|(i, d)| DriveInfo {
                    uuid: format!("drive_{id:016x}_{i}"),
                    name: d.name.clone(),
                    size: d.size,
                })
                .collect(),
            cpu: resource.cpu,
            ram: resource.ram,
            cores: resource.cores,
        })
    }

    async fn delete_node(&self, node: &Node) -> Result<(), ProviderError> {
        debug!(host = %node.hostname, "[STUB] Deleting node");
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Parameters, ResourceSpec};

    fn request(name: &str) -> NodeRequest {
        NodeRequest {
            infra_name: "edge".into(),
            resource: ResourceSpec {
                name: name.into(),
                instance_type: None,
                cpu: 1000,
                cores: 1,
                ram: 1024,
                disk: 0,
                role: "Slave".into(),
                image_id: "img".into(),
                ip: None,
                drives: vec![],
                extra_properties: Parameters::new(),
            },
            address: "10.0.0.2".into(),
        }
    }

    #[tokio::test]
    async fn test_stub_creates_and_fails_on_demand() {
        let stub = StubProvider::failing_for(["bad"]);

        let node = stub.create_node(request("good")).await.unwrap();
        assert_eq!(node.hostname, "edge-good");
        assert_eq!(node.role, "slave");

        let failure = stub.create_node(request("bad")).await.unwrap_err();
        assert_eq!(failure.hostname, "edge-bad");
        assert_eq!(stub.created(), 1);
    }

    #[tokio::test]
    async fn test_stub_address_pool() {
        let stub = StubProvider::new().with_address_pool(2);
        assert_eq!(stub.free_addresses(3).await.unwrap().len(), 2);
        assert_eq!(StubProvider::new().free_addresses(3).await.unwrap().len(), 3);
    }
}
