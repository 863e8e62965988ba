//! Error taxonomy for vault operations.
//!
//! Messages never carry a plaintext secret: crypto variants are opaque and
//! external tool output is whatever the storage engine printed.

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid peer name: {0}")]
    Validation(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("federation peer not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("{command} failed ({}): {output}", describe_status(.status))]
    ExternalTool {
        command: String,
        status: Option<i32>,
        output: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedded engine call failed: {0}")]
    Engine(anyhow::Error),
}

impl VaultError {
    /// Whether this is a remote-registration failure for a remote that is
    /// already present. Such failures are idempotent and safe to ignore.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, VaultError::ExternalTool { output, .. } if output.contains("already exists"))
    }

    /// Whether this is a remote-removal failure for a remote that does not exist.
    pub fn is_missing_remote(&self) -> bool {
        match self {
            VaultError::ExternalTool { output, .. } => {
                let lower = output.to_lowercase();
                lower.contains("unknown remote")
                    || lower.contains("no such remote")
                    || lower.contains("remote not found")
                    || (lower.contains("remote") && lower.contains("does not exist"))
            }
            _ => false,
        }
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
