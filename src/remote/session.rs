use std::fs;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::identity::RemoteIdentity;
use super::scp;
use super::transport::{CommandOutput, DialTarget, Dialer, RemoteChannel, Transport};
use super::{RemoteError, RemoteResult};
use crate::constants::{
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_SSH_TIMEOUT, NO_SUCH_FILE, SSH_PORT,
};
use crate::util::{expand_home, shell_quote};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub timeout: Duration,
    pub keepalive_interval: Duration,
    pub port: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SSH_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            port: SSH_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
    SessionOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
    Sum,
}

impl ChecksumAlgorithm {
    fn command(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5sum",
            ChecksumAlgorithm::Sha256 => "sha256sum",
            ChecksumAlgorithm::Sum => "sum",
        }
    }
}

/// Periodic no-op requests on a live connection. Exits quietly on the first
/// failure and leaves `stale` set for the foreground to find.
struct KeepAlive {
    stop: mpsc::Sender<()>,
    stale: Arc<AtomicBool>,
}

impl KeepAlive {
    fn spawn(transport: Arc<dyn Transport>, interval: Duration) -> RemoteResult<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let stale = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stale);
        thread::Builder::new()
            .name("ssh-keepalive".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if transport.keepalive().is_err() {
                            flag.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                    _ => return,
                }
            })?;
        Ok(Self { stop, stale })
    }

    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop.send(()).ok();
    }
}

struct Connection {
    transport: Arc<dyn Transport>,
    keepalive: KeepAlive,
}

/// Connection-caching command runner and file sender for one identity.
///
/// At most one connection and one open channel exist at a time. Every `run`
/// and `copy` consumes the open channel (or opens a fresh one when auto-open
/// is enabled) and closes it before returning.
pub struct RemoteSession {
    identity: RemoteIdentity,
    dialer: Arc<dyn Dialer>,
    settings: SessionSettings,
    auto_open: bool,
    remote_os: Option<String>,
    connection: Option<Connection>,
    channel: Option<Box<dyn RemoteChannel>>,
}

impl RemoteSession {
    pub fn new(identity: RemoteIdentity, dialer: Arc<dyn Dialer>, settings: SessionSettings) -> Self {
        Self {
            identity,
            dialer,
            settings,
            auto_open: true,
            remote_os: None,
            connection: None,
            channel: None,
        }
    }

    pub fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    pub fn host(&self) -> &str {
        self.identity.host()
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.connection, &self.channel) {
            (None, _) => ConnectionState::Closed,
            (Some(_), None) => ConnectionState::Open,
            (Some(_), Some(_)) => ConnectionState::SessionOpen,
        }
    }

    pub fn set_keep_alive(&mut self, interval: Duration) {
        self.settings.keepalive_interval = interval;
    }

    pub fn enable_auto_open(&mut self) {
        self.auto_open = true;
    }

    pub fn disable_auto_open(&mut self) {
        self.auto_open = false;
    }

    fn transport(&mut self) -> RemoteResult<Arc<dyn Transport>> {
        if let Some(connection) = &self.connection {
            if connection.keepalive.is_stale() {
                tracing::warn!(host = %self.identity.host(), "keep-alive failed; dropping connection");
                self.close_client();
                return Err(RemoteError::ConnectionLost {
                    host: self.identity.host().to_string(),
                });
            }
            return Ok(Arc::clone(&connection.transport));
        }

        let private_key = self.identity.parsed_key()?.to_string();
        let target = DialTarget {
            host: self.identity.host(),
            port: self.settings.port,
            user: self.identity.user(),
            private_key: &private_key,
            timeout: self.settings.timeout,
            keepalive_interval: self.settings.keepalive_interval,
        };
        let transport = self.dialer.dial(&target)?;
        let keepalive = KeepAlive::spawn(Arc::clone(&transport), self.settings.keepalive_interval)?;
        tracing::debug!(host = %self.identity.host(), "connected");
        self.connection = Some(Connection {
            transport: Arc::clone(&transport),
            keepalive,
        });
        Ok(transport)
    }

    /// Dials if needed and opens a fresh channel, replacing any unused one.
    pub fn connect(&mut self) -> RemoteResult<()> {
        self.close_session();
        let transport = self.transport()?;
        self.channel = Some(transport.open_channel()?);
        Ok(())
    }

    fn take_channel(&mut self) -> RemoteResult<Box<dyn RemoteChannel>> {
        if self.channel.is_none() {
            if !self.auto_open {
                return Err(RemoteError::NoSession);
            }
            self.connect()?;
        }
        self.channel.take().ok_or(RemoteError::NoSession)
    }

    /// Runs `command` and returns its raw output regardless of exit status.
    pub fn run_output(&mut self, command: &str) -> RemoteResult<CommandOutput> {
        let mut channel = self.take_channel()?;
        let result = channel
            .exec(command)
            .and_then(|()| channel.finish());
        channel.close();
        result
    }

    /// Runs `command` and returns its standard output; a non-zero exit is an error.
    pub fn run(&mut self, command: &str) -> RemoteResult<String> {
        let output = self.run_output(command)?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                status: output.exit_status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Streams exactly `size` bytes from `reader` to `remote_path`.
    pub fn copy<R: Read + Send>(
        &mut self,
        reader: R,
        remote_path: &str,
        permissions: &str,
        size: u64,
    ) -> RemoteResult<()> {
        scp::validate_permissions(permissions)?;
        let mut channel = self.take_channel()?;
        let result = scp::send(channel.as_mut(), remote_path, reader, permissions, size);
        channel.close();
        result
    }

    pub fn copy_bytes(&mut self, content: &[u8], remote_path: &str, permissions: &str) -> RemoteResult<()> {
        self.copy(content, remote_path, permissions, content.len() as u64)
    }

    /// Buffers `reader` to learn its length, then copies it.
    pub fn copy_reader_to_end<R: Read>(
        &mut self,
        mut reader: R,
        remote_path: &str,
        permissions: &str,
    ) -> RemoteResult<()> {
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        self.copy_bytes(&content, remote_path, permissions)
    }

    pub fn copy_local_file(&mut self, local_path: &str, remote_path: &str, permissions: &str) -> RemoteResult<()> {
        let local_path = expand_home(local_path);
        let file = fs::File::open(&local_path)?;
        let size = file.metadata()?.len();
        self.copy(file, remote_path, permissions, size)
    }

    /// True unless `stat` reports the path missing. Does not tell files from
    /// directories, and a symlink to a directory may not be recognised.
    pub fn directory_exists(&mut self, path: &str) -> RemoteResult<bool> {
        let command = format!("stat {}", shell_quote(path));
        let output = self.run_output(&command)?;
        if output.stdout.contains(NO_SUCH_FILE) || output.stderr.contains(NO_SUCH_FILE) {
            return Ok(false);
        }
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                command,
                status: output.exit_status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(true)
    }

    pub fn file_exists(&mut self, path: &str) -> RemoteResult<bool> {
        self.directory_exists(path)
    }

    /// `[ <invert> -<test> <path> ] && echo -n Yes`, e.g. `path_test("d", p, false)`.
    pub fn path_test(&mut self, test: &str, path: &str, invert: bool) -> RemoteResult<bool> {
        const EXPECTED: &str = "Yes";
        let invert = if invert { "!" } else { "" };
        let command = format!(
            "[ {invert} -{test} {} ] && echo -n \"{EXPECTED}\"",
            shell_quote(path)
        );
        let output = self.run_output(&command)?;
        Ok(output.stdout.contains(EXPECTED))
    }

    pub fn create_directory(&mut self, path: &str) -> RemoteResult<()> {
        self.run(&format!("sudo mkdir -p {}", shell_quote(path)))?;
        Ok(())
    }

    /// `Ok(false)` means confirmed absent; `Err` means the lookup itself failed.
    pub fn process_status(&mut self, name: &str) -> RemoteResult<bool> {
        let command = format!("pgrep -l {}", shell_quote(name));
        let output = self.run_output(&command)?;
        match output.exit_status {
            0 => Ok(!output.stdout.trim().is_empty()),
            1 => Ok(false),
            status => Err(RemoteError::CommandFailed {
                command,
                status,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    pub fn signal(&mut self, name: &str, signal: &str) -> RemoteResult<String> {
        self.run(&format!("pkill -{signal} {}", shell_quote(name)))
    }

    pub fn interrupt(&mut self, name: &str) -> RemoteResult<String> {
        self.signal(name, "INT")
    }

    /// Returns only the digest token of the checksum utility's output.
    pub fn checksum(&mut self, path: &str, algorithm: ChecksumAlgorithm) -> RemoteResult<String> {
        let output = self.run(&format!("{} {}", algorithm.command(), shell_quote(path)))?;
        Ok(output.split_whitespace().next().unwrap_or_default().to_string())
    }

    pub fn get_os(&mut self) -> RemoteResult<String> {
        if let Some(os) = &self.remote_os {
            return Ok(os.clone());
        }
        let os = self.run("uname")?.replace('\n', "").trim().to_lowercase();
        self.remote_os = Some(os.clone());
        Ok(os)
    }

    /// `user:group` owning `path`.
    pub fn file_ownership(&mut self, path: &str) -> RemoteResult<String> {
        let output = self.run(&format!("stat --printf=%U:%G {}", shell_quote(path)))?;
        Ok(output.trim().to_string())
    }

    /// Four-digit octal mode of `path`, e.g. `0644`.
    pub fn file_permissions(&mut self, path: &str) -> RemoteResult<String> {
        let output = self.run(&format!("stat -c%04a {}", shell_quote(path)))?;
        Ok(output.trim().to_string())
    }

    pub fn change_ownership(&mut self, path: &str, owner: &str) -> RemoteResult<()> {
        self.run(&format!("sudo chown {} {}", shell_quote(owner), shell_quote(path)))?;
        Ok(())
    }

    pub fn close_session(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    pub fn close_client(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.transport.disconnect();
        }
    }

    pub fn close(&mut self) {
        self.close_session();
        self.close_client();
    }

    /// Closes everything and scrubs the identity. The session is unusable afterwards.
    pub fn destroy(&mut self) {
        self.close();
        self.identity.clear();
    }
}
