//! Ansible inventories.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::model::{Infrastructure, Node};

pub const ANSIBLE_HOST: &str = "ansible_host";
pub const ANSIBLE_USER: &str = "ansible_user";
pub const KUBERNETES_ROLE: &str = "kubernetes_role";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryHost {
    pub name: String,
    pub vars: BTreeMap<String, String>,
}

impl InventoryHost {
    /// Host entry with connection variables.
    pub fn for_node(node: &Node) -> Self {
        Self {
            name: node.hostname.clone(),
            vars: BTreeMap::from([
                (ANSIBLE_HOST.to_string(), node.ip.clone()),
                (ANSIBLE_USER.to_string(), node.username.clone()),
            ]),
        }
    }

    /// Host entry tagged `kubernetes_role=master|node`.
    pub fn for_kubernetes_node(node: &Node) -> Self {
        let role = if node.is_master() { "master" } else { "node" };
        let mut host = Self::for_node(node);
        host.vars.insert(KUBERNETES_ROLE.to_string(), role.to_string());
        host
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryGroup {
    pub name: String,
    pub hosts: Vec<String>,
    pub vars: BTreeMap<String, String>,
}

impl InventoryGroup {
    pub fn new(name: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hosts,
            vars: BTreeMap::new(),
        }
    }
}

/// Hosts with their variables plus named groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub hosts: Vec<InventoryHost>,
    pub groups: Vec<InventoryGroup>,
}

impl Inventory {
    pub fn from_nodes(infra: &Infrastructure, host: impl Fn(&Node) -> InventoryHost) -> Self {
        Self {
            hosts: infra.all_nodes().map(host).collect(),
            groups: Vec::new(),
        }
    }

    /// Every node, no groups.
    pub fn default_all(infra: &Infrastructure) -> Self {
        Self::from_nodes(infra, InventoryHost::for_node)
    }

    /// Every node with its kubernetes role, grouped by lowercased role.
    pub fn default_kubernetes(infra: &Infrastructure) -> Self {
        let mut inventory = Self::from_nodes(infra, InventoryHost::for_kubernetes_node);
        inventory.groups = infra
            .nodes
            .iter()
            .map(|(role, nodes)| {
                InventoryGroup::new(
                    role.to_lowercase(),
                    nodes.iter().map(|n| n.hostname.clone()).collect(),
                )
            })
            .collect();
        inventory
    }

    pub fn host(&self, name: &str) -> Option<&InventoryHost> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&InventoryGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Renders and writes the INI file, creating parent folders.
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_string()).await
    }
}

fn write_vars<'a>(
    f: &mut fmt::Formatter<'_>,
    vars: impl IntoIterator<Item = (&'a String, &'a String)>,
    separator: &str,
) -> fmt::Result {
    for (key, value) in vars {
        write!(f, "{separator}{key}={value}")?;
    }
    Ok(())
}

/// INI rendering.
impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for host in &self.hosts {
            f.write_str(&host.name)?;
            write_vars(f, &host.vars, " ")?;
            writeln!(f)?;
        }

        for group in &self.groups {
            writeln!(f, "\n[{}]", group.name)?;
            for host in &group.hosts {
                writeln!(f, "{host}")?;
            }
            if !group.vars.is_empty() {
                writeln!(f, "\n[{}:vars]", group.name)?;
                for (key, value) in &group.vars {
                    writeln!(f, "{key}={value}")?;
                }
            }
        }
        Ok(())
    }
}
