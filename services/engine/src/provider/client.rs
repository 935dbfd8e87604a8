//! VM API client.
//!
//! [`VmApi`] is the slice of a cloud provider's REST API the engine needs:
//! drives, servers, server actions and the address pool. [`HttpVmClient`]
//! speaks it over HTTP with basic auth.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

/// VM API errors.
#[derive(Debug, Error)]
pub enum VmApiError {
    /// Transport failure or unreadable body.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },

    /// A list endpoint returned no objects.
    #[error("{0}: empty response")]
    Empty(&'static str),
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Bytes. Zero on a clone request keeps the image size.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(default = "default_media")]
    pub media: String,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn default_media() -> String {
    "disk".to_string()
}

/// Bytes in `mb` megabytes; `None` past `u64::MAX`.
pub fn megabytes_to_bytes(mb: u64) -> Option<u64> {
    mb.checked_mul(1024 * 1024)
}

impl DriveRecord {
    /// A new data drive request; `size_mb` is converted to bytes. `None`
    /// when the size overflows.
    pub fn request(name: impl Into<String>, size_mb: u64) -> Option<Self> {
        Some(Self {
            name: name.into(),
            size: megabytes_to_bytes(size_mb)?,
            media: default_media(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDrive {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
    pub dev_channel: String,
    pub device: String,
    pub drive: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub conf: String,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNic {
    pub ip_v4_conf: IpConfig,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRequest {
    pub name: String,
    /// MHz.
    pub cpu: u32,
    /// Bytes.
    pub mem: u64,
    pub smp: u32,
    pub vnc_password: String,
    pub drives: Vec<ServerDrive>,
    pub nics: Vec<ServerNic>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub action: String,
    pub result: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRecord {
    pub uuid: String,
    #[serde(default)]
    pub server: Option<ResourceLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectList<T> {
    objects: Vec<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Start,
    Stop,
}

impl ServerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

// =============================================================================
// API
// =============================================================================

#[async_trait]
pub trait VmApi: Send + Sync {
    /// Clones a library drive (the boot image).
    async fn clone_drive(
        &self,
        image_uuid: &str,
        drive: &DriveRecord,
    ) -> Result<DriveRecord, VmApiError>;

    async fn create_drive(&self, drive: &DriveRecord) -> Result<DriveRecord, VmApiError>;

    async fn drive(&self, uuid: &str) -> Result<DriveRecord, VmApiError>;

    async fn delete_drive(&self, uuid: &str) -> Result<(), VmApiError>;

    /// Creates a server. `Ok(None)` when the API accepted the call but
    /// returned nothing.
    async fn create_server(
        &self,
        server: &ServerRequest,
    ) -> Result<Option<ServerRecord>, VmApiError>;

    async fn server(&self, uuid: &str) -> Result<ServerRecord, VmApiError>;

    async fn server_action(
        &self,
        uuid: &str,
        action: ServerAction,
    ) -> Result<ActionResult, VmApiError>;

    async fn delete_server_with_drives(&self, uuid: &str) -> Result<(), VmApiError>;

    async fn ips(&self) -> Result<Vec<IpRecord>, VmApiError>;
}

/// Basic-auth HTTP client for the VM API.
pub struct HttpVmClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpVmClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, VmApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "VM API request");
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, VmApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "VM API call failed");
        Err(VmApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, VmApiError> {
        Ok(self.execute(request).await?.json().await?)
    }

    async fn first<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, VmApiError> {
        let list: ObjectList<T> = self.fetch(request).await?;
        Ok(list.objects.into_iter().next())
    }
}

#[async_trait]
impl VmApi for HttpVmClient {
    async fn clone_drive(
        &self,
        image_uuid: &str,
        drive: &DriveRecord,
    ) -> Result<DriveRecord, VmApiError> {
        let path = format!("/libdrives/{image_uuid}/action/?do=clone");
        self.first(self.request(reqwest::Method::POST, &path).json(drive))
            .await?
            .ok_or(VmApiError::Empty("clone drive"))
    }

    async fn create_drive(&self, drive: &DriveRecord) -> Result<DriveRecord, VmApiError> {
        let body = ObjectList {
            objects: vec![drive.clone()],
        };
        self.first(self.request(reqwest::Method::POST, "/drives/").json(&body))
            .await?
            .ok_or(VmApiError::Empty("create drive"))
    }

    async fn drive(&self, uuid: &str) -> Result<DriveRecord, VmApiError> {
        self.fetch(self.request(reqwest::Method::GET, &format!("/drives/{uuid}/")))
            .await
    }

    async fn delete_drive(&self, uuid: &str) -> Result<(), VmApiError> {
        self.execute(self.request(reqwest::Method::DELETE, &format!("/drives/{uuid}/")))
            .await?;
        Ok(())
    }

    async fn create_server(
        &self,
        server: &ServerRequest,
    ) -> Result<Option<ServerRecord>, VmApiError> {
        let body = ObjectList {
            objects: vec![server.clone()],
        };
        self.first(self.request(reqwest::Method::POST, "/servers/").json(&body))
            .await
    }

    async fn server(&self, uuid: &str) -> Result<ServerRecord, VmApiError> {
        self.fetch(self.request(reqwest::Method::GET, &format!("/servers/{uuid}/")))
            .await
    }

    async fn server_action(
        &self,
        uuid: &str,
        action: ServerAction,
    ) -> Result<ActionResult, VmApiError> {
        let path = format!("/servers/{uuid}/action/?do={}", action.as_str());
        self.fetch(self.request(reqwest::Method::POST, &path)).await
    }

    async fn delete_server_with_drives(&self, uuid: &str) -> Result<(), VmApiError> {
        let path = format!("/servers/{uuid}/?recurse=all_drives");
        self.execute(self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }

    async fn ips(&self) -> Result<Vec<IpRecord>, VmApiError> {
        let list: ObjectList<IpRecord> = self
            .fetch(self.request(reqwest::Method::GET, "/ips/detail/"))
            .await?;
        Ok(list.objects)
    }
}
