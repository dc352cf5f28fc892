use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, RunOptions};
use crate::engine::Action;
use crate::util::expand_home;

#[derive(Parser, Debug)]
#[command(name = "fleet-upgrade", version, about = "Install, upgrade and roll back software across a fleet over SSH")]
pub struct Cli {
    /// add, upgrade, resume, rollback or delete-rollback
    #[arg(long, default_value = "upgrade")]
    pub mode: String,
    /// Topology document describing groups, nodes and software
    #[arg(long = "json")]
    pub topology: PathBuf,
    /// File to load/save nodes that failed to upgrade
    #[arg(long)]
    pub failed_nodes: Option<PathBuf>,
    /// File to load/save the rollback session
    #[arg(long = "rollback-filename")]
    pub rollback_file: Option<PathBuf>,
    /// Suffix for backups made by this run (default: UTC timestamp)
    #[arg(long)]
    pub rollback_suffix: Option<String>,
    #[arg(long, default_value_t = false)]
    pub disable_node_verification: bool,
    #[arg(long, default_value_t = false)]
    pub disable_file_verification: bool,
    #[arg(long, default_value_t = false)]
    pub disable_target_dir_verification: bool,
    /// Only stop and start software; pass `--dry-run false` to make changes
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub dry_run: bool,
    /// SSH dial timeout, e.g. `5s`
    #[arg(long, value_parser = config::parse_duration)]
    pub ssh_timeout: Option<Duration>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Debug log file written when `--debug` is set
    #[arg(long)]
    pub debug_log: Option<PathBuf>,
}

impl Cli {
    pub fn topology_path(&self) -> PathBuf {
        expand_home(&self.topology)
    }

    pub fn debug_log_path(&self) -> PathBuf {
        self.debug_log
            .as_ref()
            .map(expand_home)
            .unwrap_or_else(config::default_debug_log_path)
    }

    pub fn run_options(&self) -> Result<RunOptions> {
        let action: Action = self.mode.parse()?;
        let mut options = RunOptions::new(action);
        options.dry_run = self.dry_run;
        options.verify_sources = !self.disable_file_verification;
        options.verify_nodes = !self.disable_node_verification;
        options.verify_target_dirs = !self.disable_target_dir_verification;
        options.ssh_timeout = match self.ssh_timeout {
            Some(timeout) => Some(timeout),
            None => config::env_ssh_timeout()?,
        };
        if let Some(suffix) = self.rollback_suffix.as_deref().map(str::trim) {
            if !suffix.is_empty() {
                options.rollback_suffix = suffix.to_string();
            }
        }
        if let Some(path) = &self.failed_nodes {
            options.failed_nodes_path = expand_home(path);
        }
        if let Some(path) = &self.rollback_file {
            options.rollback_path = expand_home(path);
        }
        Ok(options)
    }
}
