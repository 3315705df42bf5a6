//! treeshare node: advertise on the multicast group, answer searches over the shared tree,
//! serve and fetch single files over one-shot TCP sessions.

mod config;
mod dispatcher;
mod endpoint;
mod finder;
mod node;
mod transfer;
mod workers;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use treeshare_core::{Identifier, Report};

use crate::node::Node;
use crate::workers::NodeEvent;

#[derive(Parser, Debug)]
#[command(name = "treeshare-node", version)]
#[command(about = "Share a directory tree with nodes on the local multicast group")]
struct Args {
    /// Config file (default ~/.config/treeshare/config.toml, then /etc/treeshare/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve until Ctrl+C or SIGTERM
    Run,
    /// Listen for advertisements and list live nodes
    Nodes {
        /// How long to listen (default: one advertisement interval plus a margin)
        #[arg(long)]
        wait_ms: Option<u64>,
    },
    /// Ask every node for files whose path contains QUERY
    Search { query: String },
    /// Fetch the single file matching QUERY from TARGET (user@host)
    Download { target: String, query: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cfg = config::load(args.config.as_deref()).context("loading config")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&cfg).await,
        Command::Nodes { wait_ms } => {
            let wait = wait_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| cfg.advertisement_interval() + Duration::from_millis(500));
            nodes(&cfg, wait).await
        }
        Command::Search { query } => search(&cfg, &query).await,
        Command::Download { target, query } => {
            let target = Identifier::parse(&target).context("target must be user@host")?;
            download(&cfg, &target, &query).await
        }
    }
}

async fn run(cfg: &config::Config) -> Result<()> {
    let mut node = Node::start(cfg)?;
    info!(id = %node.identifier(), root = %cfg.root_dir.display(), "serving");
    let stop = shutdown_signal();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            res = &mut stop => {
                res?;
                break;
            }
            ev = node.next_event() => match ev {
                Some(ev) => log_event(&ev),
                None => break,
            },
        }
    }
    node.shutdown().await;
    Ok(())
}

async fn nodes(cfg: &config::Config, wait: Duration) -> Result<()> {
    let node = Node::start(cfg)?;
    tokio::time::sleep(wait).await;
    let peers = node.peers();
    if peers.is_empty() {
        println!("no nodes heard within {:?}", wait);
    }
    for p in peers {
        println!(
            "{}  port {}  search={} download={}",
            p.identifier, p.server_port, p.capabilities.search, p.capabilities.download
        );
    }
    node.shutdown().await;
    Ok(())
}

/// There is no end-of-results marker; collect for the configured window.
async fn search(cfg: &config::Config, query: &str) -> Result<()> {
    let mut node = Node::start(cfg)?;
    node.search(query).await?;
    let window = tokio::time::sleep(cfg.search_window());
    tokio::pin!(window);
    let mut replies = 0usize;
    loop {
        tokio::select! {
            _ = &mut window => break,
            ev = node.next_event() => match ev {
                Some(NodeEvent::Report(report)) => {
                    replies += 1;
                    println!("{}", report);
                }
                Some(other) => log_event(&other),
                None => break,
            },
        }
    }
    if replies == 0 {
        println!("no replies within {:?}", cfg.search_window());
    }
    node.shutdown().await;
    Ok(())
}

async fn download(cfg: &config::Config, target: &Identifier, query: &str) -> Result<()> {
    let mut node = Node::start(cfg)?;
    let outcome = fetch_one(&mut node, cfg, target, query).await;
    node.shutdown().await;
    outcome
}

async fn fetch_one(
    node: &mut Node,
    cfg: &config::Config,
    target: &Identifier,
    query: &str,
) -> Result<()> {
    if node
        .wait_for_peer(target, cfg.max_advertisement_age())
        .await
        .is_none()
    {
        bail!("{} did not advertise within {:?}", target, cfg.max_advertisement_age());
    }
    node.download(target, query).await?;

    // Reply, then the transfer itself: accept timeout plus slack for the copy.
    let limit = cfg.request_ttl() + cfg.socket_timeout();
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let ev = tokio::time::timeout_at(deadline, node.next_event())
            .await
            .map_err(|_| anyhow::anyhow!("no answer from {} within {:?}", target, limit))?;
        match ev {
            Some(NodeEvent::Report(report @ Report::DownloadReady { .. })) => println!("{}", report),
            Some(NodeEvent::Report(report)) => bail!("{}", report),
            Some(NodeEvent::Fetched { file, .. }) => {
                println!("saved {} ({} bytes)", file.path.display(), file.bytes);
                return Ok(());
            }
            Some(NodeEvent::FetchFailed { from, error }) => {
                return Err(error).with_context(|| format!("downloading from {}", from));
            }
            None => bail!("node stopped before the download finished"),
        }
    }
}

fn log_event(ev: &NodeEvent) {
    match ev {
        NodeEvent::Report(report) => info!("{}", report),
        NodeEvent::Fetched { from, file } => {
            info!(%from, path = %file.path.display(), bytes = file.bytes, "saved")
        }
        NodeEvent::FetchFailed { from, error } => {
            tracing::warn!(%from, %error, "download failed")
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown requested");
    Ok(())
}
