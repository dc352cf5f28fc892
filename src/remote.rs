mod error;
mod identity;
mod scp;
mod session;
mod ssh;
mod transport;

pub use error::{RemoteError, RemoteResult};
pub use identity::{IdentityCache, RemoteIdentity};
pub use scp::{control_line, validate_permissions, write_payload};
pub use session::{ChecksumAlgorithm, ConnectionState, RemoteSession, SessionSettings};
pub use ssh::SshDialer;
pub use transport::{CommandOutput, DialTarget, Dialer, RemoteChannel, Transport};
