use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::DEFAULT_SSH_TIMEOUT;
use crate::remote::validate_permissions;
use crate::util::expand_home;

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

fn default_ssh_timeout() -> Duration {
    DEFAULT_SSH_TIMEOUT
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommonSettings {
    #[serde(default = "default_ssh_timeout", deserialize_with = "de_duration")]
    pub ssh_timeout: Duration,
    #[serde(default, deserialize_with = "de_duration")]
    pub group_pause: Duration,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            ssh_timeout: DEFAULT_SSH_TIMEOUT,
            group_pause: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SoftwareGroup {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub software: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CopyItem {
    pub source: String,
    pub dest: String,
    pub permissions: String,
}

impl CopyItem {
    pub fn remote_dir(&self) -> String {
        match Path::new(&self.dest).parent().and_then(|p| p.to_str()) {
            Some("") | None => ".".to_string(),
            Some(parent) => parent.to_string(),
        }
    }

    pub fn backup_path(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.dest)
    }

    pub fn local_source(&self) -> PathBuf {
        expand_home(&self.source)
    }
}

/// Operation descriptor fields; every field is optional so the same shape
/// serves as software defaults and as per-node overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationDescriptor {
    pub ssh_user: Option<String>,
    pub ssh_key: Option<String>,
    pub stop_cmd: Option<String>,
    pub start_cmd: Option<String>,
    pub copy: Option<Vec<CopyItem>>,
    pub verify_checksum: Option<bool>,
    pub install_cmd: Option<String>,
    pub upgrade_cmd: Option<String>,
    pub rollback_cmd: Option<String>,
    pub delete_rollback_cmd: Option<String>,
}

impl OperationDescriptor {
    fn overlay(&mut self, other: &OperationDescriptor) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        take(&mut self.ssh_user, &other.ssh_user);
        take(&mut self.ssh_key, &other.ssh_key);
        take(&mut self.stop_cmd, &other.stop_cmd);
        take(&mut self.start_cmd, &other.start_cmd);
        take(&mut self.copy, &other.copy);
        take(&mut self.verify_checksum, &other.verify_checksum);
        take(&mut self.install_cmd, &other.install_cmd);
        take(&mut self.upgrade_cmd, &other.upgrade_cmd);
        take(&mut self.rollback_cmd, &other.rollback_cmd);
        take(&mut self.delete_rollback_cmd, &other.delete_rollback_cmd);
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeEntry {
    pub ssh_user: Option<String>,
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub software: BTreeMap<String, OperationDescriptor>,
}

/// Everything needed to operate on one software package on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpgradeInfo {
    pub node: String,
    pub software: String,
    pub ssh_user: String,
    pub ssh_key: String,
    pub copy: Vec<CopyItem>,
    pub stop_cmd: String,
    pub start_cmd: String,
    pub verify_checksum: bool,
    pub install_cmd: Option<String>,
    pub upgrade_cmd: Option<String>,
    pub rollback_cmd: Option<String>,
    pub delete_rollback_cmd: Option<String>,
}

impl NodeUpgradeInfo {
    /// Substitutes `{node}`, `{software}` and `{suffix}` in a command template.
    pub fn render(&self, template: &str, suffix: &str) -> String {
        template
            .replace("{node}", &self.node)
            .replace("{software}", &self.software)
            .replace("{suffix}", suffix)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub common: CommonSettings,
    #[serde(default)]
    pub groups: Vec<SoftwareGroup>,
    #[serde(default)]
    pub software: BTreeMap<String, OperationDescriptor>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeEntry>,
}

impl Topology {
    pub fn from_slice(contents: &[u8]) -> Result<Self> {
        let topology: Topology =
            serde_json::from_slice(contents).context("topology is not valid JSON")?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read(path)
            .with_context(|| format!("Failed to read topology {}", path.display()))?;
        Self::from_slice(&contents).with_context(|| format!("Invalid topology {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                bail!("software group {} is declared twice", group.name);
            }
            for software in &group.software {
                if !self.software.contains_key(software) {
                    bail!(
                        "software group {} references undefined software {}",
                        group.name,
                        software
                    );
                }
            }
            for node in &group.nodes {
                for software in &group.software {
                    let info = self.node_upgrade_info(node, software)?;
                    for item in &info.copy {
                        validate_permissions(&item.permissions).with_context(|| {
                            format!("copy item {} for {software} on {node}", item.dest)
                        })?;
                        if !item.dest.starts_with('/') {
                            bail!(
                                "copy destination {} for {software} on {node} must be absolute",
                                item.dest
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(|group| group.name.as_str()).collect()
    }

    pub fn group(&self, name: &str) -> Option<&SoftwareGroup> {
        self.groups.iter().find(|group| group.name == name)
    }

    pub fn group_nodes(&self, name: &str) -> &[String] {
        self.group(name).map(|group| group.nodes.as_slice()).unwrap_or_default()
    }

    pub fn group_software(&self, name: &str) -> &[String] {
        self.group(name)
            .map(|group| group.software.as_slice())
            .unwrap_or_default()
    }

    /// Distinct node names in first-seen order.
    pub fn nodes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.groups
            .iter()
            .flat_map(|group| group.nodes.iter())
            .filter(|node| seen.insert(node.as_str()))
            .cloned()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    /// Every (node, software) pair across all groups, in execution order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for group in &self.groups {
            for node in &group.nodes {
                for software in &group.software {
                    pairs.push((node.clone(), software.clone()));
                }
            }
        }
        pairs
    }

    pub fn node_upgrade_info(&self, node: &str, software: &str) -> Result<NodeUpgradeInfo> {
        let mut descriptor = self
            .software
            .get(software)
            .cloned()
            .with_context(|| format!("software {software} is not defined"))?;
        if let Some(node_entry) = self.nodes.get(node) {
            let identity = OperationDescriptor {
                ssh_user: node_entry.ssh_user.clone(),
                ssh_key: node_entry.ssh_key.clone(),
                ..OperationDescriptor::default()
            };
            descriptor.overlay(&identity);
            if let Some(overrides) = node_entry.software.get(software) {
                descriptor.overlay(overrides);
            }
        }

        let required = |value: Option<String>, field: &str| {
            value
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{field} is missing for {software} on {node}"))
        };
        Ok(NodeUpgradeInfo {
            node: node.to_string(),
            software: software.to_string(),
            ssh_user: required(descriptor.ssh_user, "ssh_user")?,
            ssh_key: required(descriptor.ssh_key, "ssh_key")?,
            stop_cmd: required(descriptor.stop_cmd, "stop_cmd")?,
            start_cmd: required(descriptor.start_cmd, "start_cmd")?,
            copy: descriptor.copy.unwrap_or_default(),
            verify_checksum: descriptor.verify_checksum.unwrap_or(false),
            install_cmd: descriptor.install_cmd,
            upgrade_cmd: descriptor.upgrade_cmd,
            rollback_cmd: descriptor.rollback_cmd,
            delete_rollback_cmd: descriptor.delete_rollback_cmd,
        })
    }

    /// Local copy sources that do not exist, each listed once.
    pub fn missing_sources(&self) -> Vec<PathBuf> {
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for (node, software) in self.pairs() {
            let Ok(info) = self.node_upgrade_info(&node, &software) else {
                continue;
            };
            for item in info.copy {
                let source = item.local_source();
                if seen.insert(source.clone()) && !source.is_file() {
                    missing.push(source);
                }
            }
        }
        missing
    }
}
