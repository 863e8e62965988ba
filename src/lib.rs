//! # peervault
//!
//! Credential vault for federation peers of a versioned SQL store.
//!
//! A peer is a named remote endpoint (URL plus optional username/password).
//! This library provides:
//! - Authenticated encryption of peer passwords at rest (AES-256-GCM)
//! - A per-installation credential key with one-time migration away from the
//!   old deterministic key
//! - CRUD over peers, kept in step with the storage engine's named remotes
//! - Delivery of a peer's credentials to exactly one sync operation
//!
//! ## Delivery strategies
//!
//! ```text
//!   PeerStore::with_peer_credentials
//!        │
//!        ├── sync_with_tool      child process, own environment snapshot
//!        │
//!        └── sync_in_process     process environment, one caller at a time
//! ```
//!
//! ## Modules
//! - `crypto`: credential key and password sealing
//! - `keys`: key file bootstrap and legacy migration
//! - `store`: peer records and SQLite persistence
//! - `remote`: storage engine remote registration
//! - `credentials`: environment delivery of credentials
//! - `sync`: running operations against a peer

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::Config;
pub use credentials::RemoteCredentials;
pub use crypto::{CredentialKey, CryptoError};
pub use error::{Result, VaultError};
pub use keys::{KeyManager, MigrationReport};
pub use remote::{CliRemoteAdapter, RemoteAdapter, RemoteInfo};
pub use store::{NewPeer, PeerRecord, PeerStore};
pub use sync::Outcome;
