//! Remote endpoint registration in the underlying storage engine.
//!
//! The engine owns its remotes; this module only talks to it. The production
//! adapter shells out to the engine CLI (`dolt remote ...` by default) in the
//! repository directory and parses its tabular listing.

use std::path::Path;
use std::process::Command;

use serde::Serialize;

use crate::error::{Result, VaultError};

/// A named remote as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteInfo {
    pub name: String,
    pub url: String,
}

/// Registers, lists and removes named remotes at a repository location.
pub trait RemoteAdapter: Send + Sync {
    fn list_remotes(&self, location: &Path) -> Result<Vec<RemoteInfo>>;

    fn add_remote(&self, location: &Path, name: &str, url: &str) -> Result<()>;

    fn remove_remote(&self, location: &Path, name: &str) -> Result<()>;
}

/// True for `git+ssh://`, `ssh://` and `git@host:` style URLs.
pub fn is_ssh_url(url: &str) -> bool {
    url.starts_with("git+ssh://") || url.starts_with("ssh://") || url.contains("git@")
}

/// Parse `<tool> remote -v` output: one remote per line, whitespace separated,
/// name then URL. Blank lines and lines with fewer than two fields are skipped.
pub fn parse_remote_listing(text: &str) -> Vec<RemoteInfo> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let url = fields.next()?;
            Some(RemoteInfo {
                name: name.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}

/// URL of the named remote, or `None` if it is absent or the listing fails.
pub fn find_remote(adapter: &dyn RemoteAdapter, location: &Path, name: &str) -> Option<String> {
    match adapter.list_remotes(location) {
        Ok(remotes) => remotes.into_iter().find(|r| r.name == name).map(|r| r.url),
        Err(e) => {
            tracing::debug!("Remote listing failed while looking up {}: {}", name, e);
            None
        }
    }
}

/// Remote adapter backed by the storage engine's command-line tool.
#[derive(Debug, Clone)]
pub struct CliRemoteAdapter {
    program: String,
    global_args: Vec<String>,
}

impl CliRemoteAdapter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
        }
    }

    /// Arguments placed before the `remote` subcommand on every call.
    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn run_remote(&self, location: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.global_args)
            .arg("remote")
            .args(args)
            .current_dir(location)
            .output()?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(VaultError::ExternalTool {
                command: format!("{} remote {}", self.program, args.first().unwrap_or(&"")),
                status: output.status.code(),
                output: combined.trim().to_string(),
            });
        }
        Ok(combined)
    }
}

impl Default for CliRemoteAdapter {
    fn default() -> Self {
        Self::new("dolt")
    }
}

impl RemoteAdapter for CliRemoteAdapter {
    fn list_remotes(&self, location: &Path) -> Result<Vec<RemoteInfo>> {
        let out = self.run_remote(location, &["-v"])?;
        Ok(parse_remote_listing(&out))
    }

    fn add_remote(&self, location: &Path, name: &str, url: &str) -> Result<()> {
        self.run_remote(location, &["add", name, url])?;
        Ok(())
    }

    fn remove_remote(&self, location: &Path, name: &str) -> Result<()> {
        self.run_remote(location, &["remove", name])?;
        Ok(())
    }
}
