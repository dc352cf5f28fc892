use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::session::{RemoteSession, SessionSettings};
use super::transport::Dialer;
use super::{RemoteError, RemoteResult};
use crate::util::expand_home;

/// Who to log in as, where, and with which key.
pub struct RemoteIdentity {
    user: String,
    host: String,
    key_path: PathBuf,
    private_key: Option<String>,
    read_error: Option<String>,
    parsed_key: Option<String>,
}

impl fmt::Debug for RemoteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteIdentity")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("key_path", &self.key_path)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RemoteIdentity {
    /// Reads the key file now; a read failure is remembered and surfaces as an
    /// authentication error on the first connection attempt.
    pub fn load(user: &str, key_path: &Path, host: &str) -> Self {
        let (private_key, read_error) = match fs::read_to_string(key_path) {
            Ok(contents) => (Some(contents), None),
            Err(err) => {
                tracing::debug!(
                    path = %key_path.display(),
                    error = %err,
                    "unable to read private key"
                );
                (None, Some(format!("unable to read {}: {err}", key_path.display())))
            }
        };
        Self {
            user: user.to_string(),
            host: host.to_string(),
            key_path: key_path.to_path_buf(),
            private_key,
            read_error,
            parsed_key: None,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    /// Validates the key material once and caches the result.
    pub(super) fn parsed_key(&mut self) -> RemoteResult<&str> {
        if self.parsed_key.is_none() {
            let key = self.private_key.as_deref().ok_or_else(|| RemoteError::Authentication {
                user: self.user.clone(),
                host: self.host.clone(),
                reason: self
                    .read_error
                    .clone()
                    .unwrap_or_else(|| "private key unavailable".to_string()),
            })?;
            let trimmed = key.trim();
            if !trimmed.starts_with("-----BEGIN") || !trimmed.contains("PRIVATE KEY-----") {
                return Err(RemoteError::Authentication {
                    user: self.user.clone(),
                    host: self.host.clone(),
                    reason: format!("{} is not a PEM private key", self.key_path.display()),
                });
            }
            self.parsed_key = Some(trimmed.to_string());
        }
        Ok(self.parsed_key.as_deref().unwrap_or_default())
    }

    /// Overwrites and forgets the credential material. Irreversible.
    pub fn clear(&mut self) {
        for secret in [self.private_key.take(), self.parsed_key.take()]
            .into_iter()
            .flatten()
        {
            let mut bytes = secret.into_bytes();
            bytes.fill(0);
        }
        self.user.clear();
        self.host.clear();
        self.read_error = None;
    }
}

/// One `RemoteSession` per distinct (host, user, key path).
pub struct IdentityCache {
    dialer: Arc<dyn Dialer>,
    settings: SessionSettings,
    sessions: HashMap<String, RemoteSession>,
}

impl IdentityCache {
    pub fn new(dialer: Arc<dyn Dialer>, settings: SessionSettings) -> Self {
        Self {
            dialer,
            settings,
            sessions: HashMap::new(),
        }
    }

    fn cache_key(host: &str, user: &str, key_path: &Path) -> String {
        format!("{host}{user}{}", key_path.display())
    }

    pub fn get_or_create(&mut self, user: &str, key_path: &str, host: &str) -> &mut RemoteSession {
        let key_path = expand_home(key_path);
        let cache_key = Self::cache_key(host, user, &key_path);
        let dialer = &self.dialer;
        let settings = &self.settings;
        self.sessions.entry(cache_key).or_insert_with(|| {
            tracing::debug!(host, user, key = %key_path.display(), "new remote identity");
            RemoteSession::new(
                RemoteIdentity::load(user, &key_path, host),
                Arc::clone(dialer),
                settings.clone(),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Closes every cached connection and scrubs credentials.
    pub fn clear_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.destroy();
        }
    }
}

impl Drop for IdentityCache {
    fn drop(&mut self) {
        self.clear_all();
    }
}
