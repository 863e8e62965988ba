//! Running sync operations against a stored peer.
//!
//! Each entry point looks the peer up, hands its credentials to the
//! operation through one delivery strategy from [`crate::credentials`], and
//! advances the peer's last-sync time when the operation succeeds.

use std::ffi::OsStr;
use std::process::Output;

use crate::credentials::{self, RemoteCredentials};
use crate::error::{Result, VaultError};
use crate::store::PeerStore;

/// A result together with non-fatal failures collected along the way.
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<VaultError>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, warning: VaultError) {
        self.warnings.push(warning);
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

fn describe_command(program: &OsStr, args: std::process::CommandArgs<'_>) -> String {
    let mut described = program.to_string_lossy().into_owned();
    for arg in args {
        described.push(' ');
        described.push_str(&arg.to_string_lossy());
    }
    described
}

/// Tool output with the peer's password masked.
fn scrub(text: &str, creds: Option<&RemoteCredentials>) -> String {
    match creds {
        Some(creds) if !creds.password().is_empty() => {
            text.replace(creds.password(), "[REDACTED]")
        }
        _ => text.to_string(),
    }
}

fn check_exit(
    command: String,
    output: Output,
    creds: Option<&RemoteCredentials>,
) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(VaultError::ExternalTool {
        command,
        status: output.status.code(),
        output: scrub(combined.trim(), creds),
    })
}

impl PeerStore {
    /// Run `op` with the named peer's credentials.
    ///
    /// `op` receives `None` when the peer has neither a username nor a
    /// password. On success the peer's last-sync time is advanced; a failure
    /// to do so is reported as a warning.
    pub fn with_peer_credentials<T, F>(&self, name: &str, op: F) -> Result<Outcome<T>>
    where
        F: FnOnce(Option<&RemoteCredentials>) -> Result<T>,
    {
        let creds = RemoteCredentials::from_peer(&self.get(name)?);
        let value = op(creds.as_ref())?;
        drop(creds);

        let mut outcome = Outcome::new(value);
        self.record_sync(name, &mut outcome);
        Ok(outcome)
    }

    fn record_sync<T>(&self, name: &str, outcome: &mut Outcome<T>) {
        match self.touch_last_sync(name) {
            Ok(()) => tracing::debug!(peer = %name, "Recorded sync"),
            Err(e) => {
                tracing::warn!(peer = %name, "Failed to record last sync: {}", e);
                outcome.warn(e);
            }
        }
    }

    /// Run an external sync command with the peer's credentials in the
    /// child's environment only.
    ///
    /// The command's environment is replaced, so set per-command variables
    /// after this call has built it, not before. A non-zero exit is an
    /// [`VaultError::ExternalTool`] carrying the combined output.
    pub fn sync_with_tool(
        &self,
        peer: &str,
        cmd: &mut std::process::Command,
    ) -> Result<Outcome<Output>> {
        self.with_peer_credentials(peer, |creds| {
            credentials::apply_to_command(cmd, creds);
            let command = describe_command(cmd.get_program(), cmd.get_args());
            tracing::info!(peer = %peer, command = %command, "Running sync command");
            let output = cmd.output()?;
            check_exit(command, output, creds)
        })
    }

    /// Async form of [`sync_with_tool`](Self::sync_with_tool).
    pub async fn sync_with_tool_async(
        &self,
        peer: &str,
        cmd: &mut tokio::process::Command,
    ) -> Result<Outcome<Output>> {
        let creds = RemoteCredentials::from_peer(&self.get(peer)?);
        credentials::apply_to_command(cmd, creds.as_ref());

        let std_cmd = cmd.as_std();
        let command = describe_command(std_cmd.get_program(), std_cmd.get_args());
        tracing::info!(peer = %peer, command = %command, "Running sync command");
        let output = cmd.output().await?;
        let output = check_exit(command, output, creds.as_ref())?;
        drop(creds);

        let mut outcome = Outcome::new(output);
        self.record_sync(peer, &mut outcome);
        Ok(outcome)
    }

    /// Run an in-process engine call that reads credentials from the
    /// process environment.
    ///
    /// Calls with credentials are serialized process-wide. Engine failures
    /// are wrapped as [`VaultError::Engine`].
    pub fn sync_in_process<T, F>(&self, peer: &str, op: F) -> Result<Outcome<T>>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        self.with_peer_credentials(peer, |creds| {
            tracing::info!(peer = %peer, "Running in-process sync");
            credentials::with_process_env(creds, op).map_err(VaultError::Engine)
        })
    }
}
