//! Seams between the session manager and the wire.
//!
//! `RemoteSession` only talks to these traits; `SshDialer` is the production
//! implementation and tests plug in a scripted one.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use super::RemoteResult;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

pub struct DialTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub user: &'a str,
    pub private_key: &'a str,
    pub timeout: Duration,
    pub keepalive_interval: Duration,
}

pub trait Dialer: Send + Sync {
    fn dial(&self, target: &DialTarget<'_>) -> RemoteResult<Arc<dyn Transport>>;
}

/// An authenticated connection able to open one-shot command channels.
pub trait Transport: Send + Sync {
    fn open_channel(&self) -> RemoteResult<Box<dyn RemoteChannel>>;
    /// Sends a no-op request; an error means the connection is presumed dead.
    fn keepalive(&self) -> RemoteResult<()>;
    fn disconnect(&self);
}

/// A single-use command channel: one `exec`, optional stdin, one `finish`.
pub trait RemoteChannel: Send {
    fn exec(&mut self, command: &str) -> RemoteResult<()>;
    /// Writer bound to the channel's standard input. Usable from another thread.
    fn stdin(&mut self) -> Box<dyn Write + Send>;
    /// Closes the write side, drains output and waits for the exit status.
    fn finish(&mut self) -> RemoteResult<CommandOutput>;
    fn close(self: Box<Self>);
}
