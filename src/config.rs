use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEBUG_LOG_FILE, DEFAULT_KEEPALIVE_INTERVAL, FAILED_NODES_FILE, ROLLBACK_FILE,
    ROLLBACK_SUFFIX_FORMAT, SSH_TIMEOUT_ENV, STATE_DIR_ENV,
};
use crate::engine::Action;

/// Every process-wide knob of a run, passed explicitly into the engine.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub action: Action,
    pub dry_run: bool,
    pub verify_sources: bool,
    pub verify_nodes: bool,
    pub verify_target_dirs: bool,
    /// Overrides the topology's `common.ssh_timeout` when set.
    pub ssh_timeout: Option<Duration>,
    pub keepalive_interval: Duration,
    /// Suffix for backups made by this run. Rollback and delete-rollback
    /// always use the suffix recorded in the rollback session instead.
    pub rollback_suffix: String,
    pub failed_nodes_path: PathBuf,
    pub rollback_path: PathBuf,
}

impl RunOptions {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            dry_run: true,
            verify_sources: true,
            verify_nodes: true,
            verify_target_dirs: true,
            ssh_timeout: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            rollback_suffix: default_rollback_suffix(),
            failed_nodes_path: default_failed_nodes_path(),
            rollback_path: default_rollback_path(),
        }
    }

    pub fn resolve_ssh_timeout(&self, topology_timeout: Duration) -> Duration {
        self.ssh_timeout.unwrap_or(topology_timeout)
    }
}

pub fn state_dir() -> PathBuf {
    std::env::var(STATE_DIR_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_failed_nodes_path() -> PathBuf {
    state_dir().join(FAILED_NODES_FILE)
}

pub fn default_rollback_path() -> PathBuf {
    state_dir().join(ROLLBACK_FILE)
}

pub fn default_debug_log_path() -> PathBuf {
    state_dir().join(DEBUG_LOG_FILE)
}

pub fn default_rollback_suffix() -> String {
    chrono::Utc::now().format(ROLLBACK_SUFFIX_FORMAT).to_string()
}

pub fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim()).with_context(|| format!("invalid duration {raw:?}"))
}

/// SSH timeout from the environment, if set.
pub fn env_ssh_timeout() -> Result<Option<Duration>> {
    match std::env::var(SSH_TIMEOUT_ENV) {
        Ok(raw) if !raw.trim().is_empty() => parse_duration(&raw)
            .with_context(|| format!("{SSH_TIMEOUT_ENV} is invalid"))
            .map(Some),
        _ => Ok(None),
    }
}
