use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("permissions need to be 4 characters, got {0:?}")]
    InvalidPermissions(String),
    #[error("remote filename is empty in {0:?}")]
    EmptyRemoteFilename(String),
    #[error("copied size: {written} not equal to file size: {expected}")]
    SizeMismatch { written: u64, expected: u64 },
    #[error("no SSH session opened")]
    NoSession,
    #[error("connection to {host} was lost")]
    ConnectionLost { host: String },
    #[error("authentication failed for {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },
    #[error("failed to connect to {host}: {source}")]
    Dial {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type RemoteResult<T> = Result<T, RemoteError>;
