//! Federation peer credential storage.
//!
//! Peers are persisted in the `federation_peers` SQLite table. Passwords are
//! sealed with the active [`CredentialKey`](crate::crypto::CredentialKey)
//! before they reach the database and opened again on every read.
//!
//! SECURITY: decrypted passwords live only in [`PeerRecord`] and
//! [`NewPeer`], both of which redact the password in `Debug` output and
//! zeroize it on drop.

mod sqlite;

pub use sqlite::PeerStore;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Maximum length of a peer name.
pub const MAX_PEER_NAME_LEN: usize = 64;

fn peer_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").expect("valid peer name regex"))
}

/// Check that a peer name is safe to use as a remote name.
pub fn validate_peer_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VaultError::Validation("peer name cannot be empty".to_string()));
    }
    if name.len() > MAX_PEER_NAME_LEN {
        return Err(VaultError::Validation(format!(
            "peer name too long (max {} characters)",
            MAX_PEER_NAME_LEN
        )));
    }
    if !peer_name_regex().is_match(name) {
        return Err(VaultError::Validation(
            "peer name must start with a letter and contain only alphanumeric characters, \
             hyphens, and underscores"
                .to_string(),
        ));
    }
    Ok(())
}

/// Timestamp format used for all stored times.
pub(crate) fn now_string() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Input for [`PeerStore::add_or_update`].
pub struct NewPeer {
    pub name: String,
    pub remote_url: String,
    pub username: Option<String>,
    password: Zeroizing<String>,
    /// Opaque policy tag, stored and returned without interpretation.
    pub sovereignty: String,
}

impl NewPeer {
    pub fn new(name: impl Into<String>, remote_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_url: remote_url.into(),
            username: None,
            password: Zeroizing::new(String::new()),
            sovereignty: String::new(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        let username = username.into();
        self.username = (!username.is_empty()).then_some(username);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Zeroizing::new(password.into());
        self
    }

    pub fn with_sovereignty(mut self, sovereignty: impl Into<String>) -> Self {
        self.sovereignty = sovereignty.into();
        self
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for NewPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewPeer")
            .field("name", &self.name)
            .field("remote_url", &self.remote_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("sovereignty", &self.sovereignty)
            .finish()
    }
}

/// A stored peer with its password decrypted.
#[derive(Clone, Serialize)]
pub struct PeerRecord {
    pub name: String,
    pub remote_url: String,
    pub username: Option<String>,
    /// Decrypted password; empty when none is stored. Never serialized.
    #[serde(skip)]
    password: Zeroizing<String>,
    pub sovereignty: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }

    pub fn username_str(&self) -> &str {
        self.username.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("name", &self.name)
            .field("remote_url", &self.remote_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("sovereignty", &self.sovereignty)
            .field("last_sync", &self.last_sync)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.name, self.remote_url)?;
        if let Some(user) = &self.username {
            write!(f, " (user {})", user)?;
        }
        Ok(())
    }
}
