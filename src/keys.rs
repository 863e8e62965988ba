//! Credential key lifecycle.
//!
//! One random AES-256 key per data directory, stored as raw bytes in
//! `<data_dir>/.peervault-credential-key` (mode 0600, directory mode 0700).
//!
//! ## Key schemes
//!
//! ```text
//! scheme 1  SHA-256(data_dir || "beads-federation-key-v1")  deterministic, legacy
//! scheme 2  random 32 bytes in the key file                  current
//! ```
//!
//! The scheme in effect is recorded in the `vault_meta` table. Upgrading from
//! scheme 1 re-encrypts every password that opens under the legacy key and
//! records scheme 2 in the same transaction. The new key file is written
//! before that transaction commits, so an interrupted upgrade is simply
//! re-run on the next start.
//!
//! Bootstrap is serialized across processes with an exclusive lock on
//! `<data_dir>/.peervault-credential-key.lock`.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, CredentialKey, KEY_LENGTH};
use crate::error::{Result, VaultError};

/// Name of the key file inside the data directory.
pub const KEY_FILE_NAME: &str = ".peervault-credential-key";

const LOCK_FILE_NAME: &str = ".peervault-credential-key.lock";

/// Version tag mixed into the legacy deterministic key.
const LEGACY_KEY_TAG: &str = "beads-federation-key-v1";

/// Scheme recorded once the random key file is authoritative.
pub const CURRENT_KEY_SCHEME: i64 = 2;

const SCHEME_META_KEY: &str = "credential_key_scheme";

/// Outcome of a legacy-key migration pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Peers whose password was re-encrypted under the new key.
    pub migrated: Vec<String>,
    /// Peers whose password did not open under the legacy key and were left as is.
    pub skipped: Vec<String>,
}

/// Owns the single active credential key for a data directory.
#[derive(Debug, Clone)]
pub struct KeyManager {
    data_dir: Option<PathBuf>,
}

impl KeyManager {
    /// `None` means no persistent data directory: encryption is unavailable.
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn key_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(KEY_FILE_NAME))
    }

    /// Load the key file, or generate and persist a new key.
    ///
    /// Runs the one-time legacy migration against `conn` whenever the
    /// recorded scheme is older than [`CURRENT_KEY_SCHEME`]. Returns `None`
    /// when no data directory is configured.
    pub fn init_key(&self, conn: &mut Connection) -> Result<Option<CredentialKey>> {
        let Some(dir) = self.data_dir.as_deref() else {
            tracing::info!("No data directory configured; credential encryption unavailable");
            return Ok(None);
        };

        ensure_private_dir(dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE_NAME))?;
        lock.lock_exclusive()?;

        let result = self.bootstrap_locked(dir, conn);

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!("Failed to release credential key lock: {}", e);
        }
        result.map(Some)
    }

    fn bootstrap_locked(&self, dir: &Path, conn: &mut Connection) -> Result<CredentialKey> {
        let key_path = dir.join(KEY_FILE_NAME);
        let scheme = recorded_scheme(conn)?;

        // Another process may have written the key while we waited on the lock.
        let key = match read_key_file(&key_path)? {
            Some(key) => {
                tracing::debug!("Loaded credential key from {}", key_path.display());
                key
            }
            None => {
                if scheme >= CURRENT_KEY_SCHEME {
                    tracing::warn!(
                        "Credential key file {} is missing but the store already uses scheme {}; \
                         existing peer passwords will not decrypt",
                        key_path.display(),
                        scheme
                    );
                }
                let key = CredentialKey::generate();
                write_key_file(dir, &key)?;
                tracing::info!("Generated new credential key at {}", key_path.display());
                key
            }
        };

        if scheme < CURRENT_KEY_SCHEME {
            let tx = conn.transaction()?;
            let report = self.migrate(&tx, &key)?;
            record_scheme(&tx, CURRENT_KEY_SCHEME)?;
            tx.commit()?;
            tracing::info!(
                migrated = report.migrated.len(),
                skipped = report.skipped.len(),
                "Credential key scheme upgraded from {} to {}",
                scheme,
                CURRENT_KEY_SCHEME
            );
        }

        Ok(key)
    }

    /// The deterministic scheme-1 key, used only as a migration source.
    pub fn legacy_key(&self) -> Option<CredentialKey> {
        let dir = self.data_dir.as_ref()?;
        let mut hasher = Sha256::new();
        hasher.update(dir.to_string_lossy().as_bytes());
        hasher.update(LEGACY_KEY_TAG.as_bytes());
        let digest: [u8; KEY_LENGTH] = hasher.finalize().into();
        Some(CredentialKey::from_bytes(digest))
    }

    /// Re-encrypt every stored password that opens under the legacy key.
    ///
    /// Rows that do not open are left untouched and reported as skipped. A
    /// missing peer table means there is nothing to migrate.
    pub fn migrate(&self, conn: &Connection, new_key: &CredentialKey) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let Some(old_key) = self.legacy_key() else {
            return Ok(report);
        };
        if !table_exists(conn, "federation_peers")? {
            return Ok(report);
        }

        let rows = {
            let mut stmt = conn.prepare(
                "SELECT name, password_encrypted FROM federation_peers
                 WHERE password_encrypted IS NOT NULL AND LENGTH(password_encrypted) > 0
                 ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for (name, sealed) in rows {
            let plaintext = match crypto::decrypt(&sealed, &old_key) {
                Ok(p) => Zeroizing::new(p),
                Err(_) => {
                    tracing::warn!(
                        peer = %name,
                        "Stored password does not open under the legacy key; leaving it unchanged"
                    );
                    report.skipped.push(name);
                    continue;
                }
            };

            let resealed = crypto::encrypt(&plaintext, new_key)?;
            conn.execute(
                "UPDATE federation_peers SET password_encrypted = ?1 WHERE name = ?2",
                params![resealed, name],
            )?;
            tracing::debug!(peer = %name, "Re-encrypted password under new credential key");
            report.migrated.push(name);
        }

        Ok(report)
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_meta_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vault_meta (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Scheme version recorded in `vault_meta`, or 0 when nothing is recorded.
pub fn recorded_scheme(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "vault_meta")? {
        return Ok(0);
    }
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM vault_meta WHERE key = ?1",
            [SCHEME_META_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn record_scheme(conn: &Connection, scheme: i64) -> Result<()> {
    ensure_meta_table(conn)?;
    conn.execute(
        "INSERT INTO vault_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEME_META_KEY, scheme.to_string()],
    )?;
    Ok(())
}

/// Read the key file. A missing file or one of the wrong size yields `None`.
fn read_key_file(path: &Path) -> Result<Option<CredentialKey>> {
    let bytes = match fs::read(path) {
        Ok(b) => Zeroizing::new(b),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VaultError::Io(e)),
    };
    match CredentialKey::from_slice(&bytes) {
        Ok(key) => Ok(Some(key)),
        Err(_) => {
            tracing::warn!(
                "Ignoring credential key file {} with unexpected length {}",
                path.display(),
                bytes.len()
            );
            Ok(None)
        }
    }
}

/// Write the key atomically: owner-only temp file, fsync, rename.
fn write_key_file(dir: &Path, key: &CredentialKey) -> Result<()> {
    let final_path = dir.join(KEY_FILE_NAME);
    let tmp_path = dir.join(format!("{}.tmp-{}", KEY_FILE_NAME, Uuid::new_v4()));

    let written = (|| -> std::io::Result<()> {
        let mut file = create_owner_only(&tmp_path)?;
        file.write_all(key.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(VaultError::Io(e));
    }
    Ok(())
}

fn create_owner_only(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
        builder.mode(0o700);
        builder.create(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    builder.create(dir)?;
    Ok(())
}
