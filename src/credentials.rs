//! Credential delivery to sync operations.
//!
//! Peer credentials reach the storage engine through exactly two environment
//! variables, [`REMOTE_USER_ENV`] and [`REMOTE_PASSWORD_ENV`]. There are two
//! ways to deliver them, and one operation uses exactly one of them:
//!
//! - **Subprocess isolation** ([`apply_to_command`]): the child gets its own
//!   environment snapshot. The ambient environment is copied, stale
//!   credential variables are stripped, and this peer's credentials are
//!   appended. The parent environment is never touched, so concurrent
//!   children for different peers cannot see each other's secrets.
//! - **Process environment** ([`with_process_env`]): for the in-process
//!   engine, which only reads the ambient environment. The variables are set
//!   on the real process environment under one process-wide lock and removed
//!   again before the lock is released, on every exit path including panics.
//!
//! Prefer [`RemoteCredentials::env_pairs`] for any consumer that accepts
//! explicit variables; the process-environment path is a fallback.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::store::PeerRecord;

/// Variable carrying the remote username.
pub const REMOTE_USER_ENV: &str = "DOLT_REMOTE_USER";

/// Variable carrying the remote password.
pub const REMOTE_PASSWORD_ENV: &str = "DOLT_REMOTE_PASSWORD";

/// Guards the credential variables in the process environment.
static CREDENTIAL_ENV_LOCK: Mutex<()> = Mutex::new(());

/// Transient username/password pair for one delivery call.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RemoteCredentials {
    username: String,
    password: String,
}

impl RemoteCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials for a stored peer, or `None` when it has neither a
    /// username nor a password.
    pub fn from_peer(peer: &PeerRecord) -> Option<Self> {
        let creds = Self::new(peer.username_str(), peer.password());
        (!creds.is_empty()).then_some(creds)
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// The non-empty credential variables as explicit `(name, value)` pairs.
    pub fn env_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::with_capacity(2);
        if !self.username.is_empty() {
            pairs.push((REMOTE_USER_ENV, self.username.as_str()));
        }
        if !self.password.is_empty() {
            pairs.push((REMOTE_PASSWORD_ENV, self.password.as_str()));
        }
        pairs
    }
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn is_credential_var(name: &OsStr) -> bool {
    name == REMOTE_USER_ENV || name == REMOTE_PASSWORD_ENV
}

fn build_isolated_env<I>(ambient: I, creds: &RemoteCredentials) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = ambient
        .into_iter()
        .filter(|(name, _)| !is_credential_var(name))
        .collect();
    env.extend(
        creds
            .env_pairs()
            .into_iter()
            .map(|(name, value)| (OsString::from(name), OsString::from(value))),
    );
    env
}

/// Snapshot of the current process environment with stale credential
/// variables removed and `creds` appended.
pub fn isolated_env(creds: &RemoteCredentials) -> Vec<(OsString, OsString)> {
    build_isolated_env(std::env::vars_os(), creds)
}

/// A process builder that can carry a credential environment.
pub trait CommandEnv {
    fn replace_env(&mut self, vars: Vec<(OsString, OsString)>);

    fn strip_credentials(&mut self);
}

impl CommandEnv for std::process::Command {
    fn replace_env(&mut self, vars: Vec<(OsString, OsString)>) {
        self.env_clear().envs(vars);
    }

    fn strip_credentials(&mut self) {
        self.env_remove(REMOTE_USER_ENV)
            .env_remove(REMOTE_PASSWORD_ENV);
    }
}

impl CommandEnv for tokio::process::Command {
    fn replace_env(&mut self, vars: Vec<(OsString, OsString)>) {
        self.env_clear().envs(vars);
    }

    fn strip_credentials(&mut self) {
        self.env_remove(REMOTE_USER_ENV)
            .env_remove(REMOTE_PASSWORD_ENV);
    }
}

/// Attach an isolated credential environment to a single child process.
///
/// With credentials the command's environment is replaced, so call this
/// before adding any per-command variables. Without credentials the child
/// keeps the ambient environment minus both credential variables.
pub fn apply_to_command<C: CommandEnv>(cmd: &mut C, creds: Option<&RemoteCredentials>) {
    match creds {
        Some(creds) if !creds.is_empty() => cmd.replace_env(isolated_env(creds)),
        _ => cmd.strip_credentials(),
    }
}

fn credential_env_lock() -> MutexGuard<'static, ()> {
    // The guard below always cleans up, so a poisoned lock carries no stale state.
    CREDENTIAL_ENV_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Credential variables set on the process environment; removed on drop.
struct InjectedEnv;

impl InjectedEnv {
    fn set(creds: &RemoteCredentials) -> Self {
        for (name, value) in [
            (REMOTE_USER_ENV, creds.username()),
            (REMOTE_PASSWORD_ENV, creds.password()),
        ] {
            if value.is_empty() {
                std::env::remove_var(name);
            } else {
                std::env::set_var(name, value);
            }
        }
        InjectedEnv
    }
}

impl Drop for InjectedEnv {
    fn drop(&mut self) {
        std::env::remove_var(REMOTE_USER_ENV);
        std::env::remove_var(REMOTE_PASSWORD_ENV);
    }
}

/// Run `op` with `creds` set on the process environment.
///
/// At most one such call is in flight per process. Without credentials `op`
/// runs directly, with no lock and no environment change.
pub fn with_process_env<T, E, F>(creds: Option<&RemoteCredentials>, op: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    let creds = match creds {
        Some(creds) if !creds.is_empty() => creds,
        _ => return op(),
    };

    // Declaration order matters: the environment is cleared before the lock is released.
    let _lock = credential_env_lock();
    let _env = InjectedEnv::set(creds);
    op()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn os_pair(name: &str, value: &str) -> (OsString, OsString) {
        (OsString::from(name), OsString::from(value))
    }

    fn assert_process_env_clean() {
        let _guard = credential_env_lock();
        assert!(std::env::var_os(REMOTE_USER_ENV).is_none());
        assert!(std::env::var_os(REMOTE_PASSWORD_ENV).is_none());
    }

    #[test]
    fn test_env_pairs_skip_empty_values() {
        let creds = RemoteCredentials::new("alice", "");
        assert_eq!(creds.env_pairs(), vec![(REMOTE_USER_ENV, "alice")]);

        let creds = RemoteCredentials::new("", "pw");
        assert_eq!(creds.env_pairs(), vec![(REMOTE_PASSWORD_ENV, "pw")]);

        assert!(RemoteCredentials::new("", "").is_empty());
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", RemoteCredentials::new("alice", "hunter2"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_isolated_env_strips_stale_credentials() {
        let ambient = vec![
            os_pair("PATH", "/usr/bin"),
            os_pair(REMOTE_USER_ENV, "stale-user"),
            os_pair(REMOTE_PASSWORD_ENV, "stale-pass"),
            os_pair("HOME", "/home/me"),
        ];
        let env = build_isolated_env(ambient, &RemoteCredentials::new("a", "a1"));

        assert_eq!(
            env,
            vec![
                os_pair("PATH", "/usr/bin"),
                os_pair("HOME", "/home/me"),
                os_pair(REMOTE_USER_ENV, "a"),
                os_pair(REMOTE_PASSWORD_ENV, "a1"),
            ]
        );
    }

    #[test]
    fn test_isolated_env_only_appends_present_values() {
        let ambient = vec![os_pair(REMOTE_PASSWORD_ENV, "stale-pass")];
        let env = build_isolated_env(ambient, &RemoteCredentials::new("bob", ""));
        assert_eq!(env, vec![os_pair(REMOTE_USER_ENV, "bob")]);
    }

    #[test]
    fn test_apply_to_command_without_credentials_only_strips() {
        for creds in [None, Some(RemoteCredentials::new("", ""))] {
            let mut cmd = std::process::Command::new("true");
            cmd.env("KEEP_ME", "1");
            apply_to_command(&mut cmd, creds.as_ref());

            let envs: Vec<_> = cmd.get_envs().collect();
            assert_eq!(envs.len(), 3);
            assert!(envs.contains(&(OsStr::new("KEEP_ME"), Some(OsStr::new("1")))));
            assert!(envs.contains(&(OsStr::new(REMOTE_USER_ENV), None)));
            assert!(envs.contains(&(OsStr::new(REMOTE_PASSWORD_ENV), None)));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_child_without_credentials_never_sees_injected_ones() {
        let outer = RemoteCredentials::new("engine-user", "engine-pass");
        let seen = with_process_env(Some(&outer), || {
            let mut cmd = std::process::Command::new("/bin/sh");
            cmd.arg("-c")
                .arg(r#"printf '%s:%s' "$DOLT_REMOTE_USER" "$DOLT_REMOTE_PASSWORD""#);
            apply_to_command(&mut cmd, None);
            let output = cmd.output().map_err(|e| e.to_string())?;
            Ok::<_, String>(String::from_utf8_lossy(&output.stdout).into_owned())
        })
        .unwrap();
        assert_eq!(seen, ":");
    }

    #[cfg(unix)]
    fn child_credentials(creds: &RemoteCredentials) -> String {
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(r#"sleep 0.02; printf '%s:%s' "$DOLT_REMOTE_USER" "$DOLT_REMOTE_PASSWORD""#);
        apply_to_command(&mut cmd, Some(creds));
        let output = cmd.output().expect("spawn sh");
        String::from_utf8(output.stdout).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_concurrent_subprocesses_see_only_their_credentials() {
        let peers = [("a", "a1"), ("b", "b1")];
        let barrier = Arc::new(Barrier::new(peers.len()));

        let handles: Vec<_> = peers
            .iter()
            .map(|&(user, pass)| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let creds = RemoteCredentials::new(user, pass);
                    barrier.wait();
                    for _ in 0..5 {
                        assert_eq!(child_credentials(&creds), format!("{}:{}", user, pass));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_subprocess_path_ignores_process_env_injection() {
        // A subprocess spawned while the in-process path holds credentials
        // must still see only its own.
        let outer = RemoteCredentials::new("engine-user", "engine-pass");
        let child = RemoteCredentials::new("b", "b1");
        let seen = with_process_env(Some(&outer), || Ok::<_, ()>(child_credentials(&child)))
            .unwrap();
        assert_eq!(seen, "b:b1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_to_tokio_command() {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(r#"printf '%s' "$DOLT_REMOTE_USER""#);
        apply_to_command(&mut cmd, Some(&RemoteCredentials::new("async-user", "")));
        let output = cmd.output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "async-user");
    }

    #[test]
    fn test_process_env_is_set_during_op_and_cleared_after() {
        let creds = RemoteCredentials::new("alice", "secret");
        let seen = with_process_env(Some(&creds), || {
            Ok::<_, ()>((
                std::env::var(REMOTE_USER_ENV).ok(),
                std::env::var(REMOTE_PASSWORD_ENV).ok(),
            ))
        })
        .unwrap();
        assert_eq!(seen, (Some("alice".to_string()), Some("secret".to_string())));
        assert_process_env_clean();
    }

    #[test]
    fn test_process_env_cleared_after_error() {
        let creds = RemoteCredentials::new("alice", "secret");
        let result: Result<(), &str> = with_process_env(Some(&creds), || Err("push rejected"));
        assert_eq!(result, Err("push rejected"));
        assert_process_env_clean();
    }

    #[test]
    fn test_process_env_cleared_after_panic() {
        let creds = RemoteCredentials::new("alice", "secret");
        let result = catch_unwind(AssertUnwindSafe(|| {
            with_process_env(Some(&creds), || -> Result<(), ()> { panic!("engine aborted") })
        }));
        assert!(result.is_err());
        assert_process_env_clean();

        // The lock is still usable afterwards.
        let ok = with_process_env(Some(&creds), || Ok::<_, ()>(42)).unwrap();
        assert_eq!(ok, 42);
    }

    #[test]
    fn test_missing_field_does_not_leak_previous_value() {
        let creds = RemoteCredentials::new("only-user", "");
        let password = with_process_env(Some(&creds), || {
            Ok::<_, ()>(std::env::var_os(REMOTE_PASSWORD_ENV))
        })
        .unwrap();
        assert!(password.is_none());
    }

    #[test]
    fn test_empty_credentials_skip_the_lock() {
        // Holding the lock here would deadlock if the shortcut tried to take it.
        let _guard = credential_env_lock();
        assert_eq!(with_process_env(None, || Ok::<_, ()>(1)).unwrap(), 1);
        let empty = RemoteCredentials::new("", "");
        assert_eq!(with_process_env(Some(&empty), || Ok::<_, ()>(2)).unwrap(), 2);
    }

    #[test]
    fn test_process_env_calls_never_interleave() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [("a", "a1"), ("b", "b1")]
            .into_iter()
            .map(|(user, pass)| {
                let in_flight = in_flight.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let creds = RemoteCredentials::new(user, pass);
                    barrier.wait();
                    for _ in 0..5 {
                        with_process_env(Some(&creds), || {
                            assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                            for _ in 0..3 {
                                assert_eq!(std::env::var(REMOTE_USER_ENV).unwrap(), user);
                                assert_eq!(std::env::var(REMOTE_PASSWORD_ENV).unwrap(), pass);
                                thread::sleep(Duration::from_millis(5));
                            }
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, ()>(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_process_env_clean();
    }
}
