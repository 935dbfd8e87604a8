//! Node lifecycle over the VM API.

use async_trait::async_trait;
use futures_util::future::join_all;
use hyde_networking::{sanitize_hostname, MAX_HOSTNAME_LEN};
use hyde_reconcile::{wait_for_status_change, PollConfig};
use tracing::{error, info, instrument, warn};

use super::client::{
    megabytes_to_bytes, DriveRecord, IpConfig, ServerAction, ServerDrive, ServerNic,
    ServerRequest, VmApi,
};
use super::{NodeFailure, NodeRequest, ProviderAdapter, ProviderError, ProviderTimeouts};
use crate::model::{DriveInfo, DriveSpec, Node, ResourceSpec};
use crate::secrets::node_password;

const DRIVE_READY: &str = "unmounted";
const SERVER_RUNNING: &str = "running";
const SERVER_STOPPED: &str = "stopped";
const ACTION_SUCCESS: &str = "success";

/// [`ProviderAdapter`] over any [`VmApi`].
pub struct VmProvider<C> {
    client: C,
    username: String,
    timeouts: ProviderTimeouts,
}

impl<C: VmApi> VmProvider<C> {
    pub fn new(client: C, username: impl Into<String>, timeouts: ProviderTimeouts) -> Self {
        Self {
            client,
            username: username.into(),
            timeouts,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Waits for a drive to leave `initial` and requires it to be unmounted.
    async fn wait_for_drive(&self, uuid: &str, initial: &str) -> Result<(), ProviderError> {
        let client = &self.client;
        let what = format!("drive {uuid}");

        let status = wait_for_status_change(
            &initial.to_string(),
            &self.timeouts.disk_ready(),
            move || async move { client.drive(uuid).await.map(|d| d.status) },
        )
        .await
        .map_err(|e| ProviderError::from_poll(what.clone(), e))?;

        expect_status(what, DRIVE_READY, status)
    }

    async fn wait_for_server(
        &self,
        uuid: &str,
        initial: &str,
        expected: &'static str,
        config: PollConfig,
    ) -> Result<(), ProviderError> {
        let client = &self.client;
        let what = format!("server {uuid}");

        let status = wait_for_status_change(&initial.to_string(), &config, move || async move {
            client.server(uuid).await.map(|s| s.status)
        })
        .await
        .map_err(|e| ProviderError::from_poll(what.clone(), e))?;

        expect_status(what, expected, status)
    }

    /// Clones the boot image. The uuid is returned whenever the clone
    /// exists, even if it never became ready.
    async fn clone_boot_drive(
        &self,
        host: &str,
        resource: &ResourceSpec,
    ) -> (Option<String>, Result<(), ProviderError>) {
        let Some(request) = DriveRecord::request(format!("boot-{host}"), resource.disk) else {
            return (None, Err(oversized("disk", resource.disk)));
        };

        let cloned = match self.client.clone_drive(&resource.image_id, &request).await {
            Ok(drive) => drive,
            Err(e) => {
                error!(image = %resource.image_id, error = %e, "Error cloning boot drive");
                return (None, Err(e.into()));
            }
        };
        if cloned.uuid.is_empty() {
            return (
                None,
                Err(ProviderError::NotMaterialized(format!("boot drive of {host}"))),
            );
        }

        let ready = self.wait_for_drive(&cloned.uuid, "cloning_dst").await;
        (Some(cloned.uuid), ready)
    }

    async fn create_data_drive(
        &self,
        host: &str,
        spec: &DriveSpec,
    ) -> (Option<DriveInfo>, Result<(), ProviderError>) {
        let name = format!("data-{host}-{}", spec.name);
        let Some(request) = DriveRecord::request(&name, spec.size) else {
            return (None, Err(oversized(&spec.name, spec.size)));
        };
        let created = match self.client.create_drive(&request).await {
            Ok(drive) => drive,
            Err(e) => {
                error!(drive = %name, error = %e, "Error creating data drive");
                return (None, Err(e.into()));
            }
        };
        if created.uuid.is_empty() {
            return (None, Err(ProviderError::NotMaterialized(name)));
        }

        let ready = self.wait_for_drive(&created.uuid, "creating").await;
        let info = DriveInfo {
            uuid: created.uuid,
            name,
            size: spec.size,
        };
        (Some(info), ready)
    }

    /// Everything after hostname validation. Identifiers are written into
    /// `node` as soon as they exist so a failure can be cleaned up.
    async fn build_node(
        &self,
        node: &mut Node,
        resource: &ResourceSpec,
        password: String,
    ) -> Result<(), ProviderError> {
        let host = node.hostname.clone();

        let (boot, data) = tokio::join!(
            self.clone_boot_drive(&host, resource),
            join_all(
                resource
                    .drives
                    .iter()
                    .map(|spec| self.create_data_drive(&host, spec))
            ),
        );

        let (boot_uuid, boot_ready) = boot;
        node.drive_uuid = boot_uuid;
        let mut first_error = boot_ready.err();
        for (info, ready) in data {
            node.data_drives.extend(info);
            if let Err(e) = ready {
                first_error = first_error.or(Some(e));
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(host = %host, drives = node.data_drives.len() + 1, "Host drives ready");

        let boot_uuid = node
            .drive_uuid
            .clone()
            .ok_or_else(|| ProviderError::NotMaterialized(format!("boot drive of {host}")))?;
        let request = server_request(node, resource, &boot_uuid, password)?;

        let server = self
            .client
            .create_server(&request)
            .await?
            .filter(|s| !s.uuid.is_empty())
            .ok_or_else(|| ProviderError::NotMaterialized(format!("server {host}")))?;
        node.uuid = Some(server.uuid.clone());
        info!(host = %host, server = %server.uuid, "Server created");

        let started = self
            .client
            .server_action(&server.uuid, ServerAction::Start)
            .await?;
        if started.result != ACTION_SUCCESS {
            return Err(ProviderError::ActionFailed {
                server: server.uuid,
                action: ServerAction::Start.as_str(),
                result: started.result,
            });
        }

        self.wait_for_server(&server.uuid, "starting", SERVER_RUNNING, self.timeouts.boot())
            .await?;
        info!(host = %host, server = %server.uuid, "Server running");
        Ok(())
    }

    /// Best-effort removal of whatever `node` references. Returns every
    /// error hit on the way.
    async fn remove(&self, node: &Node) -> Vec<ProviderError> {
        match &node.uuid {
            Some(uuid) => match self.remove_server(uuid).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![e],
            },
            None => self.remove_drives(node).await,
        }
    }

    async fn remove_server(&self, uuid: &str) -> Result<(), ProviderError> {
        let status = match self.client.server(uuid).await {
            Ok(server) => server.status,
            Err(e) => {
                warn!(server = %uuid, error = %e, "Could not read server status, assuming running");
                SERVER_RUNNING.to_string()
            }
        };

        if status == SERVER_RUNNING {
            info!(server = %uuid, "Stopping server");
            let stopped = self.client.server_action(uuid, ServerAction::Stop).await?;
            if stopped.result != ACTION_SUCCESS {
                return Err(ProviderError::ActionFailed {
                    server: uuid.to_string(),
                    action: ServerAction::Stop.as_str(),
                    result: stopped.result,
                });
            }
            self.wait_for_server(uuid, "stopping", SERVER_STOPPED, self.timeouts.stop())
                .await?;
        }

        self.client.delete_server_with_drives(uuid).await?;
        info!(server = %uuid, "Server deleted with its drives");
        Ok(())
    }

    async fn remove_drives(&self, node: &Node) -> Vec<ProviderError> {
        let uuids = node
            .data_drives
            .iter()
            .map(|d| d.uuid.as_str())
            .chain(node.drive_uuid.as_deref());

        let mut errors = Vec::new();
        for uuid in uuids {
            match self.client.delete_drive(uuid).await {
                Ok(()) => info!(drive = %uuid, "Drive deleted"),
                Err(e) => {
                    error!(drive = %uuid, error = %e, "Error deleting drive");
                    errors.push(e.into());
                }
            }
        }
        errors
    }
}

fn expect_status(
    what: String,
    expected: &'static str,
    actual: String,
) -> Result<(), ProviderError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ProviderError::UnexpectedStatus {
            what,
            expected,
            actual,
        })
    }
}

fn oversized(what: &str, megabytes: u64) -> ProviderError {
    ProviderError::SizeOverflow {
        what: what.to_string(),
        megabytes,
    }
}

/// Rejects any size whose byte count overflows.
fn check_sizes(resource: &ResourceSpec) -> Result<(), ProviderError> {
    match resource
        .sizes_mb()
        .find(|(_, mb)| megabytes_to_bytes(*mb).is_none())
    {
        Some((what, mb)) => Err(oversized(what, mb)),
        None => Ok(()),
    }
}

fn server_request(
    node: &Node,
    resource: &ResourceSpec,
    boot_uuid: &str,
    password: String,
) -> Result<ServerRequest, ProviderError> {
    let boot = ServerDrive {
        boot_order: Some(1),
        dev_channel: "0:0".to_string(),
        device: "virtio".to_string(),
        drive: boot_uuid.to_string(),
    };
    let data = node.data_drives.iter().enumerate().map(|(i, d)| ServerDrive {
        boot_order: Some(i as u32 + 2),
        dev_channel: format!("0:{}", i + 1),
        device: "virtio".to_string(),
        drive: d.uuid.clone(),
    });

    Ok(ServerRequest {
        name: node.hostname.clone(),
        cpu: resource.cpu,
        mem: megabytes_to_bytes(resource.ram).ok_or_else(|| oversized("ram", resource.ram))?,
        smp: resource.cores,
        vnc_password: password,
        drives: std::iter::once(boot).chain(data).collect(),
        nics: vec![ServerNic {
            ip_v4_conf: IpConfig {
                conf: "static".to_string(),
                ip: Some(node.ip.clone()),
            },
            model: "virtio".to_string(),
        }],
    })
}

#[async_trait]
impl<C: VmApi> ProviderAdapter for VmProvider<C> {
    async fn free_addresses(&self, count: usize) -> Result<Vec<String>, ProviderError> {
        let ips = self.client.ips().await?;
        Ok(ips
            .into_iter()
            .filter(|ip| ip.server.is_none())
            .map(|ip| ip.uuid)
            .take(count)
            .collect())
    }

    #[instrument(skip(self, request), fields(resource = %request.resource.name))]
    async fn create_node(&self, request: NodeRequest) -> Result<Node, NodeFailure> {
        let raw = request.raw_hostname();
        let hostname = sanitize_hostname(&raw, MAX_HOSTNAME_LEN)
            .map_err(|e| NodeFailure::new(raw, e.into()))?;

        let resource = request.resource;
        check_sizes(&resource).map_err(|e| NodeFailure::new(hostname.clone(), e))?;

        let mut node = Node {
            hostname,
            role: resource.role.to_lowercase(),
            ip: request.address,
            username: self.username.clone(),
            uuid: None,
            drive_uuid: None,
            data_drives: Vec::new(),
            cpu: resource.cpu,
            ram: resource.ram,
            cores: resource.cores,
        };
        info!(host = %node.hostname, ip = %node.ip, "Creating node");

        match self.build_node(&mut node, &resource, node_password()).await {
            Ok(()) => {
                info!(host = %node.hostname, "Node ready");
                Ok(node)
            }
            Err(source) => {
                error!(host = %node.hostname, error = %source, "Node creation failed, undoing");
                let cleanup = self.remove(&node).await;
                for e in &cleanup {
                    error!(host = %node.hostname, error = %e, "Cleanup of partial node failed");
                }
                Err(NodeFailure {
                    hostname: node.hostname,
                    source,
                    cleanup,
                })
            }
        }
    }

    #[instrument(skip(self, node), fields(host = %node.hostname))]
    async fn delete_node(&self, node: &Node) -> Result<(), ProviderError> {
        let mut errors = self.remove(node).await.into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                for extra in errors {
                    error!(error = %extra, "Additional error deleting node");
                }
                Err(first)
            }
        }
    }
}
