use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hyde_networking::PortRange;
use hyde_reconcile::PollConfig;

use crate::db::{DbConfig, StoreBackend};
use crate::provider::{ProviderTimeouts, DEFAULT_VM_USERNAME};
use crate::provision::ProvisionerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreBackend,
    pub provisioning: ProvisionerSettings,
    pub provider_timeouts: ProviderTimeouts,
    pub vm_username: String,
    pub kube_timeout: Duration,
    pub ansible_playbook: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .parse()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a number of seconds, got {raw:?}")),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let listen_addr = var("HYDE_LISTEN_ADDR", "0.0.0.0:8080")
            .parse()
            .context("HYDE_LISTEN_ADDR")?;

        let log_level = var("HYDE_LOG_LEVEL", "info");

        let dev_mode = lookup("HYDE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = match var("HYDE_REPOSITORY", "memory").as_str() {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres(DbConfig::from_env()),
            other => bail!("HYDE_REPOSITORY must be memory or postgres, got {other:?}"),
        };

        let poll_interval = secs("HYDE_POLL_INTERVAL_SECS", 3)?;
        let provider_timeouts = ProviderTimeouts {
            poll_interval,
            disk: secs("HYDE_DISK_TIMEOUT_SECS", 60)?,
            boot: secs("HYDE_BOOT_TIMEOUT_SECS", 120)?,
            stop: secs("HYDE_STOP_TIMEOUT_SECS", 60)?,
        };

        let provisioning = ProvisionerSettings {
            scripts_folder: PathBuf::from(var("HYDE_SCRIPTS_FOLDER", "provision/ansible")),
            inventory_folder: PathBuf::from(var(
                "HYDE_INVENTORY_FOLDER",
                "/tmp/ansible_inventories",
            )),
            port_range: parse_port_range(&var("HYDE_NODE_PORT_RANGE", "30000-32767"))?,
            deletion: PollConfig::new(poll_interval, secs("HYDE_DELETION_TIMEOUT_SECS", 120)?),
            storage_cluster: PollConfig::new(
                poll_interval,
                secs("HYDE_STORAGE_CLUSTER_TIMEOUT_SECS", 300)?,
            ),
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store,
            provisioning,
            provider_timeouts,
            vm_username: var("HYDE_VM_USERNAME", DEFAULT_VM_USERNAME),
            kube_timeout: secs("HYDE_KUBE_TIMEOUT_SECS", 30)?,
            ansible_playbook: var("HYDE_ANSIBLE_PLAYBOOK", "ansible-playbook"),
        })
    }
}

/// Parses `start-end`.
fn parse_port_range(raw: &str) -> Result<PortRange> {
    let Some((start, end)) = raw.split_once('-') else {
        bail!("HYDE_NODE_PORT_RANGE must look like start-end, got {raw:?}");
    };
    let start = u16::from_str(start.trim()).context("HYDE_NODE_PORT_RANGE start")?;
    let end = u16::from_str(end.trim()).context("HYDE_NODE_PORT_RANGE end")?;
    Ok(PortRange::new(start, end)?)
}
