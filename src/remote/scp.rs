//! Sender side of the `scp -t` receive protocol.
//!
//! The remote end is started with `sudo /usr/bin/scp -t <dir>`; we feed it a
//! control line `C<perm> <size> <name>\n`, exactly `size` payload bytes and a
//! single NUL byte on its standard input.

use std::io::{self, Read, Write};
use std::path::Path;

use super::transport::RemoteChannel;
use super::{RemoteError, RemoteResult};
use crate::util::shell_quote;

const RECEIVE_COMMAND: &str = "sudo /usr/bin/scp -t";

pub fn validate_permissions(permissions: &str) -> RemoteResult<()> {
    if permissions.chars().count() != 4 {
        return Err(RemoteError::InvalidPermissions(permissions.to_string()));
    }
    Ok(())
}

pub fn control_line(permissions: &str, size: u64, filename: &str) -> String {
    format!("C{permissions} {size} {filename}\n")
}

/// Splits `remote_path` into its directory and file name.
pub(super) fn split_remote_path(remote_path: &str) -> RemoteResult<(String, String)> {
    let path = Path::new(remote_path);
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RemoteError::EmptyRemoteFilename(remote_path.to_string()))?;
    let directory = match path.parent().and_then(|parent| parent.to_str()) {
        Some("") | None => ".",
        Some(parent) => parent,
    };
    Ok((directory.to_string(), filename.to_string()))
}

pub(super) fn receive_command(directory: &str) -> String {
    format!("{RECEIVE_COMMAND} {}", shell_quote(directory))
}

/// Writes the control line, at most `size` bytes from `reader`, then the NUL
/// terminator. Returns how many payload bytes were actually written.
pub fn write_payload<W: Write, R: Read>(
    writer: &mut W,
    reader: R,
    permissions: &str,
    size: u64,
    filename: &str,
) -> io::Result<u64> {
    writer.write_all(control_line(permissions, size, filename).as_bytes())?;
    let written = io::copy(&mut reader.take(size), writer)?;
    writer.write_all(&[0])?;
    writer.flush()?;
    Ok(written)
}

/// Feeds `reader` to an `scp -t` receiver on `channel` and waits for it to
/// exit.
///
/// The payload is written on the calling thread. libssh2 serializes every
/// channel operation through one session lock, so a concurrent reader would
/// only block the writer.
pub(super) fn send<R: Read>(
    channel: &mut dyn RemoteChannel,
    remote_path: &str,
    reader: R,
    permissions: &str,
    size: u64,
) -> RemoteResult<()> {
    let (directory, filename) = split_remote_path(remote_path)?;
    let command = receive_command(&directory);
    channel.exec(&command)?;

    let mut stdin = channel.stdin();
    let written = write_payload(&mut stdin, reader, permissions, size, &filename);
    drop(stdin);

    let finished = channel.finish();
    let written = written?;
    if written != size {
        return Err(RemoteError::SizeMismatch {
            written,
            expected: size,
        });
    }
    let output = finished?;
    if !output.success() {
        return Err(RemoteError::CommandFailed {
            command,
            status: output.exit_status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(())
}
