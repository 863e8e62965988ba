//! SQLite-backed peer store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use zeroize::Zeroizing;

use super::{now_string, parse_timestamp, validate_peer_name, NewPeer, PeerRecord};
use crate::crypto::{self, CredentialKey, CryptoError};
use crate::error::{Result, VaultError};
use crate::keys::KeyManager;
use crate::remote::{is_ssh_url, RemoteAdapter};
use crate::sync::Outcome;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS federation_peers (
    name TEXT PRIMARY KEY NOT NULL,
    remote_url TEXT NOT NULL,
    username TEXT,
    password_encrypted BLOB,
    sovereignty TEXT NOT NULL DEFAULT '',
    last_sync TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vault_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "peers.db";

const PEER_COLUMNS: &str =
    "name, remote_url, username, password_encrypted, sovereignty, last_sync, created_at, updated_at";

/// Raw row, before the password is opened.
struct StoredPeer {
    name: String,
    remote_url: String,
    username: Option<String>,
    password_encrypted: Option<Vec<u8>>,
    sovereignty: String,
    last_sync: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StoredPeer {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            remote_url: row.get(1)?,
            username: row.get(2)?,
            password_encrypted: row.get(3)?,
            sovereignty: row.get(4)?,
            last_sync: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

/// CRUD over peer credential records.
///
/// Holds the credential key for its whole lifetime; rotating the key means
/// opening a new store.
pub struct PeerStore {
    conn: Mutex<Connection>,
    key: Option<CredentialKey>,
    remotes: Arc<dyn RemoteAdapter>,
    location: PathBuf,
}

impl PeerStore {
    /// Open the store for a data directory.
    ///
    /// With a data directory the database lives at `<data_dir>/peers.db` and
    /// the credential key is loaded (or bootstrapped). Without one the store
    /// is in-memory and passwords cannot be stored.
    pub fn open(
        data_dir: Option<&Path>,
        location: impl Into<PathBuf>,
        remotes: Arc<dyn RemoteAdapter>,
    ) -> Result<Self> {
        let mut conn = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Connection::open(dir.join(DB_FILE_NAME))?
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;

        let key = KeyManager::new(data_dir.map(Path::to_path_buf)).init_key(&mut conn)?;
        Self::with_connection(conn, key, location, remotes)
    }

    /// Build a store over an existing connection and an already loaded key.
    pub fn with_connection(
        conn: Connection,
        key: Option<CredentialKey>,
        location: impl Into<PathBuf>,
        remotes: Arc<dyn RemoteAdapter>,
    ) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key,
            remotes,
            location: location.into(),
        })
    }

    pub fn encryption_available(&self) -> bool {
        self.key.is_some()
    }

    /// Directory handed to the remote adapter.
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn remotes(&self) -> &dyn RemoteAdapter {
        self.remotes.as_ref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement
        // behind; SQLite rolls it back.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn encrypt_password(&self, password: &str) -> Result<Option<Vec<u8>>> {
        if password.is_empty() {
            return Ok(None);
        }
        let key = self.key.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        Ok(crypto::encrypt(password, key)?)
    }

    fn decrypt_password(&self, sealed: Option<&[u8]>) -> Result<Zeroizing<String>> {
        match sealed {
            None => Ok(Zeroizing::new(String::new())),
            Some(bytes) if bytes.is_empty() => Ok(Zeroizing::new(String::new())),
            Some(bytes) => {
                let key = self.key.as_ref().ok_or(CryptoError::KeyUnavailable)?;
                Ok(Zeroizing::new(crypto::decrypt(bytes, key)?))
            }
        }
    }

    fn open_record(&self, stored: StoredPeer) -> Result<PeerRecord> {
        let password = self.decrypt_password(stored.password_encrypted.as_deref())?;
        let created_at = parse_timestamp(&stored.created_at).unwrap_or_default();
        Ok(PeerRecord {
            name: stored.name,
            remote_url: stored.remote_url,
            username: stored.username.filter(|u| !u.is_empty()),
            password,
            sovereignty: stored.sovereignty,
            last_sync: stored.last_sync.as_deref().and_then(parse_timestamp),
            created_at,
            updated_at: parse_timestamp(&stored.updated_at).unwrap_or(created_at),
        })
    }

    /// Add a peer, or replace every mutable field of an existing one.
    ///
    /// Also registers the peer as a remote; a remote that already exists is
    /// not an error.
    pub fn add_or_update(&self, peer: NewPeer) -> Result<()> {
        validate_peer_name(&peer.name)?;
        let sealed = self.encrypt_password(peer.password())?;
        let now = now_string();

        self.conn().execute(
            "INSERT INTO federation_peers
                (name, remote_url, username, password_encrypted, sovereignty, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(name) DO UPDATE SET
                remote_url = excluded.remote_url,
                username = excluded.username,
                password_encrypted = excluded.password_encrypted,
                sovereignty = excluded.sovereignty,
                updated_at = excluded.updated_at",
            params![
                peer.name,
                peer.remote_url,
                peer.username,
                sealed,
                peer.sovereignty,
                now
            ],
        )?;
        tracing::debug!(
            peer = %peer.name,
            has_password = sealed.is_some(),
            "Stored federation peer"
        );

        match self
            .remotes
            .add_remote(&self.location, &peer.name, &peer.remote_url)
        {
            Ok(()) => {
                tracing::info!(
                    peer = %peer.name,
                    ssh = is_ssh_url(&peer.remote_url),
                    "Registered remote"
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                tracing::debug!(peer = %peer.name, "Remote already registered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch one peer with its password decrypted.
    pub fn get(&self, name: &str) -> Result<PeerRecord> {
        let stored = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM federation_peers WHERE name = ?1", PEER_COLUMNS),
                [name],
                StoredPeer::from_row,
            )
            .optional()?
            .ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        self.open_record(stored)
    }

    /// All peers ordered by name, each decrypted like [`get`](Self::get).
    pub fn list(&self) -> Result<Vec<PeerRecord>> {
        let stored = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM federation_peers ORDER BY name ASC",
                PEER_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], StoredPeer::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        stored.into_iter().map(|s| self.open_record(s)).collect()
    }

    /// Delete a peer and unregister its remote.
    ///
    /// The remote is removed even when no row existed, so remotes created
    /// outside this store can still be cleaned up. The returned value tells
    /// whether a row was deleted; remote cleanup failures become warnings.
    pub fn remove(&self, name: &str) -> Result<Outcome<bool>> {
        let deleted = self
            .conn()
            .execute("DELETE FROM federation_peers WHERE name = ?1", [name])?;
        if deleted == 0 {
            tracing::debug!(peer = %name, "No stored credentials; removing remote only");
        } else {
            tracing::info!(peer = %name, "Removed federation peer");
        }

        let mut outcome = Outcome::new(deleted > 0);
        match self.remotes.remove_remote(&self.location, name) {
            Ok(()) => {}
            Err(e) if e.is_missing_remote() => {
                tracing::debug!(peer = %name, "Remote was not registered");
            }
            Err(e) => {
                tracing::warn!(peer = %name, "Best-effort remote removal failed: {}", e);
                outcome.warn(e);
            }
        }
        Ok(outcome)
    }

    /// Advance the advisory last-sync timestamp.
    pub fn touch_last_sync(&self, name: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE federation_peers SET last_sync = ?1 WHERE name = ?2",
            params![now_string(), name],
        )?;
        Ok(())
    }
}
