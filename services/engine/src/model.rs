//! Deployment records and the requests that create them.
//!
//! Records are persisted as whole documents, so every type here derives
//! serde and keeps field names stable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hyde_id::{DeploymentId, InfrastructureId, SecretId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Parameters
// =============================================================================

/// String key/value bag used for extra properties, provisioner arguments
/// and provisioner results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// True only for a present value that reads as a boolean true.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
    }

    /// Boolean with a default for absent or unparseable values.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            Some("true" | "1" | "yes") => true,
            Some("false" | "0" | "no") => false,
            _ => default,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn extend(&mut self, other: Parameters) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Body of a create-deployment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub infrastructures: Vec<InfrastructureSpec>,
}

/// One cloud site to provision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureSpec {
    /// Unique within the deployment; prefixes every hostname.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// "cloud" or "edge".
    #[serde(rename = "type", default)]
    pub kind: String,
    pub provider: ProviderInfo,
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub extra_properties: Parameters,
}

/// Provider endpoint and credentials as supplied by the caller.
///
/// Either `secret_id` or `credentials` must be present. Inline credentials
/// are moved into the vault before anything is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub api_endpoint: String,
    pub api_type: String,
    #[serde(default)]
    pub secret_id: Option<SecretId>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

/// A compute node to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Hostname suffix; the hostname is `{infrastructure}-{name}`.
    pub name: String,
    #[serde(rename = "type", default)]
    pub instance_type: Option<String>,
    /// CPU speed in MHz.
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub cores: u32,
    /// RAM in MB.
    #[serde(default)]
    pub ram: u64,
    /// Boot disk size in MB.
    #[serde(default)]
    pub disk: u64,
    pub role: String,
    pub image_id: String,
    /// Fixed address; otherwise one is drawn from the free pool.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub drives: Vec<DriveSpec>,
    #[serde(default)]
    pub extra_properties: Parameters,
}

impl ResourceSpec {
    /// Memory, boot disk and data drive sizes in MB.
    pub fn sizes_mb(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        [("ram", self.ram), ("disk", self.disk)]
            .into_iter()
            .chain(self.drives.iter().map(|d| (d.name.as_str(), d.size)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveSpec {
    pub name: String,
    /// "SSD" or "HDD".
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Size in MB.
    pub size: u64,
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Creating,
    Running,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfrastructureStatus {
    Creating,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub status: DeploymentStatus,
    pub infrastructures: Vec<Infrastructure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::new(),
            name: name.into(),
            status: DeploymentStatus::Creating,
            infrastructures: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn infrastructure(&self, id: &InfrastructureId) -> Option<&Infrastructure> {
        self.infrastructures.iter().find(|i| i.id == *id)
    }

    pub fn infrastructure_mut(&mut self, id: &InfrastructureId) -> Option<&mut Infrastructure> {
        self.infrastructures.iter_mut().find(|i| i.id == *id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persisted reference to a provider; credentials live in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub api_endpoint: String,
    pub api_type: String,
    pub secret_id: SecretId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Infrastructure {
    pub id: InfrastructureId,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub provider: ProviderRef,
    pub status: InfrastructureStatus,
    /// Nodes keyed by role (`master`, `slave`, ...).
    #[serde(default)]
    pub nodes: BTreeMap<String, Vec<Node>>,
    /// Installed products and their provisioner-private configuration.
    #[serde(default)]
    pub products: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub extra_properties: Parameters,
}

impl Infrastructure {
    pub fn new(spec: &InfrastructureSpec, provider: ProviderRef) -> Self {
        Self {
            id: InfrastructureId::new(),
            name: spec.name.clone(),
            kind: spec.kind.clone(),
            provider,
            status: InfrastructureStatus::Creating,
            nodes: BTreeMap::new(),
            products: BTreeMap::new(),
            extra_properties: spec.extra_properties.clone(),
        }
    }

    /// Every node, in role order.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.entry(node.role.clone()).or_default().push(node);
    }

    pub fn has_product(&self, product: &str) -> bool {
        self.products.contains_key(product)
    }

    pub fn product_names(&self) -> Vec<&str> {
        self.products.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub role: String,
    pub ip: String,
    pub username: String,
    /// Compute instance id, absent until the instance exists.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Boot disk id, absent until the disk exists.
    #[serde(default)]
    pub drive_uuid: Option<String>,
    #[serde(default)]
    pub data_drives: Vec<DriveInfo>,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub ram: u64,
    #[serde(default)]
    pub cores: u32,
}

impl Node {
    pub fn is_master(&self) -> bool {
        self.role.eq_ignore_ascii_case("master")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub uuid: String,
    pub name: String,
    /// Size in MB.
    pub size: u64,
}
