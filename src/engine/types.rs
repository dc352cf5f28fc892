use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// What a run does to every selected (node, software) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Upgrade,
    ResumeUpgrade,
    Rollback,
    DeleteRollback,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Upgrade => "upgrade",
            Action::ResumeUpgrade => "resume-upgrade",
            Action::Rollback => "rollback",
            Action::DeleteRollback => "delete-rollback",
        }
    }

    /// Whether the software is stopped before and started after the action.
    pub fn brackets_service(self) -> bool {
        !matches!(self, Action::Add | Action::DeleteRollback)
    }

    pub fn is_upgrade(self) -> bool {
        matches!(self, Action::Upgrade | Action::ResumeUpgrade)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = PreflightError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Action::Add),
            "upgrade" => Ok(Action::Upgrade),
            "resume" | "resume-upgrade" | "resumeupgrade" => Ok(Action::ResumeUpgrade),
            "rollback" => Ok(Action::Rollback),
            "delete" | "delete-rollback" | "deleterollback" => Ok(Action::DeleteRollback),
            _ => Err(PreflightError::InvalidAction(raw.to_string())),
        }
    }
}

/// Conditions that stop a run before any remote mutation.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("invalid action: {0:?}")]
    InvalidAction(String),
    #[error("missing source files:\n{}", join_paths(.0))]
    MissingSources(Vec<PathBuf>),
    #[error("{}", unresolved_lines(.0))]
    UnresolvableNodes(Vec<String>),
    #[error("Error(s) encountered in target directory verification.\n{}", .0.join("\n"))]
    TargetDirectories(Vec<String>),
    #[error("Can't {action} as {} doesn't exist", path.display())]
    MissingStateFile { action: Action, path: PathBuf },
    #[error("discarded unreadable state file {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn unresolved_lines(nodes: &[String]) -> String {
    nodes
        .iter()
        .map(|node| format!("Can't resolve {node}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => f.write_str("completed"),
            RunStatus::Aborted => f.write_str("aborted"),
        }
    }
}

/// Tally of one run. `processed` counts pairs that were attempted;
/// `skipped` counts pairs filtered out by the run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            status: RunStatus::Aborted,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }
}
