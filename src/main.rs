//! peervault - federation peer credential vault
//!
//! Usage:
//!   peervault list
//!   peervault add <name> <url> [username] [--password-stdin] [--sovereignty <tag>]
//!   peervault remove <name>
//!   peervault exec <peer> <program> [args...]

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context};
use peervault::config::Config;
use peervault::remote::CliRemoteAdapter;
use peervault::store::{NewPeer, PeerStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

const USAGE: &str = "usage: peervault <list | add <name> <url> [username] [--password-stdin] \
                     [--sovereignty <tag>] | remove <name> | exec <peer> <program> [args...]>";

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peervault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: data_dir={}, repo_dir={}, tool={}",
        config
            .data_dir
            .as_deref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(in-memory)".to_string()),
        config.repo_dir.display(),
        config.remote_tool
    );

    let store = open_store(config).await?;
    if !store.encryption_available() {
        warn!("No credential key available; peers with passwords cannot be stored");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("list") => run_blocking(&store, &args[1..], |store, _| list(store)).await,
        Some("add") => run_blocking(&store, &args[1..], add).await,
        Some("remove") => run_blocking(&store, &args[1..], remove).await,
        Some("exec") => exec(&store, &args[1..]).await,
        _ => bail!(USAGE),
    }
}

async fn open_store(config: Config) -> anyhow::Result<Arc<PeerStore>> {
    let remotes = Arc::new(CliRemoteAdapter::new(config.remote_tool.clone()));
    let store = tokio::task::spawn_blocking(move || {
        PeerStore::open(config.data_dir.as_deref(), config.repo_dir, remotes)
    })
    .await
    .context("store initialization panicked")??;
    Ok(Arc::new(store))
}

/// Run a store command on the blocking pool; SQLite and the remote CLI block.
async fn run_blocking<F>(store: &Arc<PeerStore>, args: &[String], command: F) -> anyhow::Result<()>
where
    F: FnOnce(&PeerStore, &[String]) -> anyhow::Result<()> + Send + 'static,
{
    let store = Arc::clone(store);
    let args = args.to_vec();
    tokio::task::spawn_blocking(move || command(&store, &args))
        .await
        .context("store command panicked")?
}

fn list(store: &PeerStore) -> anyhow::Result<()> {
    let peers = store.list()?;
    println!("{}", serde_json::to_string_pretty(&peers)?);
    Ok(())
}

fn add(store: &PeerStore, args: &[String]) -> anyhow::Result<()> {
    let mut positional = Vec::new();
    let mut password_stdin = false;
    let mut sovereignty = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--password-stdin" => password_stdin = true,
            "--sovereignty" => {
                sovereignty = Some(iter.next().context("--sovereignty needs a value")?.clone())
            }
            _ => positional.push(arg.clone()),
        }
    }

    let (name, url) = match positional.as_slice() {
        [name, url, ..] => (name.clone(), url.clone()),
        _ => bail!(USAGE),
    };

    let mut peer = NewPeer::new(name.clone(), url);
    if let Some(username) = positional.get(2) {
        peer = peer.with_username(username.clone());
    }
    if let Some(tag) = sovereignty {
        peer = peer.with_sovereignty(tag);
    }
    if password_stdin {
        let mut line = Zeroizing::new(String::new());
        std::io::stdin().lock().read_line(&mut line)?;
        peer = peer.with_password(line.trim_end_matches(['\r', '\n']));
    }

    store.add_or_update(peer)?;
    info!(peer = %name, "Peer saved");
    Ok(())
}

fn remove(store: &PeerStore, args: &[String]) -> anyhow::Result<()> {
    let name = args.first().context(USAGE)?;
    let outcome = store.remove(name)?;
    for warning in &outcome.warnings {
        warn!(peer = %name, "{}", warning);
    }
    if !outcome.value {
        warn!(peer = %name, "No stored credentials for peer");
    }
    Ok(())
}

async fn exec(store: &PeerStore, args: &[String]) -> anyhow::Result<()> {
    let (peer, program, rest) = match args {
        [peer, program, rest @ ..] => (peer, program, rest),
        _ => bail!(USAGE),
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(rest).current_dir(store.location());
    let outcome = store.sync_with_tool_async(peer, &mut cmd).await?;
    for warning in &outcome.warnings {
        warn!(peer = %peer, "{}", warning);
    }

    std::io::stdout().write_all(&outcome.value.stdout)?;
    std::io::stderr().write_all(&outcome.value.stderr)?;
    Ok(())
}
