use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Set of (node, software) pairs, stored as `node -> [software]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSoftwareSet(BTreeMap<String, BTreeSet<String>>);

impl NodeSoftwareSet {
    pub fn contains(&self, node: &str, software: &str) -> bool {
        self.0
            .get(node)
            .is_some_and(|entries| entries.contains(software))
    }

    pub fn add(&mut self, node: &str, software: &str) {
        self.0
            .entry(node.to_string())
            .or_default()
            .insert(software.to_string());
    }

    pub fn remove(&mut self, node: &str, software: &str) {
        if let Some(entries) = self.0.get_mut(node) {
            entries.remove(software);
            if entries.is_empty() {
                self.0.remove(node);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .flat_map(|(node, entries)| {
                entries
                    .iter()
                    .map(move |software| (node.clone(), software.clone()))
            })
            .collect()
    }
}

/// Pairs still waiting for a successful upgrade.
pub type FailedNodeSoftware = NodeSoftwareSet;

/// Pairs that were upgraded under `session_suffix` and can be rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSession {
    pub session_suffix: String,
    pub mode: String,
    #[serde(default)]
    pub rollback_info: NodeSoftwareSet,
    /// `node -> [dest]` for destinations that had no previous version when
    /// they were upgraded. A rollback only ever deletes these.
    #[serde(default, skip_serializing_if = "NodeSoftwareSet::is_empty")]
    pub new_files: NodeSoftwareSet,
}

impl RollbackSession {
    pub fn new(session_suffix: &str, mode: &str) -> Self {
        Self {
            session_suffix: session_suffix.to_string(),
            mode: mode.to_string(),
            rollback_info: NodeSoftwareSet::default(),
            new_files: NodeSoftwareSet::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rollback_info.is_empty() && self.new_files.is_empty()
    }

    pub fn clear(&mut self) {
        self.rollback_info.clear();
        self.new_files.clear();
    }
}

/// Outcome of reading a state file that may legitimately be absent.
#[derive(Debug)]
pub enum Loaded<T> {
    Missing,
    Corrupt(String),
    Present(T),
}

pub fn load_state<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>> {
    if !path.exists() {
        return Ok(Loaded::Missing);
    }
    let contents = fs::read_to_string(path)?;
    Ok(match serde_json::from_str(&contents) {
        Ok(value) => Loaded::Present(value),
        Err(err) => Loaded::Corrupt(err.to_string()),
    })
}

pub fn save_state<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(state)?;
    fs::write(path, contents)?;
    Ok(())
}
