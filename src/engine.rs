mod actions;
mod preflight;
mod runner;
mod types;

pub use preflight::resolves;
pub use runner::Engine;
pub use types::{Action, PreflightError, RunReport, RunStatus};
