// p2pfs: split files into chunks, serve them to peers, fetch and reassemble files from peers.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use p2pfs_core::FileStore;
use p2pfs_node::{config, BootstrapClient, NodeConfig, PeerNode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "p2pfs", version, about = "Peer-to-peer chunked file distribution")]
struct Cli {
    /// Config file (default: ~/.config/p2pfs/config.toml, then /etc/p2pfs/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for peers until Ctrl-C or SIGTERM
    Serve,
    /// Chunk a file into the local store and record its metadata
    Split { file: PathBuf },
    /// Fetch a file's metadata and chunks from a peer
    Fetch {
        peer: String,
        name: String,
        /// Also reassemble the fetched file here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rebuild a file from locally stored metadata and chunks
    Reassemble { name: String, output: PathBuf },
    /// Check that a peer answers
    Ping { peer: String },
    /// Upload a split file's chunks to the HTTP bootstrap server
    Push { name: String },
    /// Download one chunk by hash from the HTTP bootstrap server
    Pull { hash: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;
    let store = FileStore::open(&cfg.data_dir)
        .with_context(|| format!("opening store at {}", cfg.data_dir.display()))?;

    match cli.command {
        Command::Serve => serve(&cfg, store).await,
        Command::Split { file } => {
            let splitter = store.clone();
            let meta = tokio::task::spawn_blocking(move || splitter.split(&file)).await??;
            println!(
                "{}: {} bytes in {} chunks",
                meta.file_name,
                meta.total_size,
                meta.chunk_count()
            );
            for hash in &meta.chunk_hashes {
                println!("  {hash}");
            }
            Ok(())
        }
        Command::Fetch { peer, name, output } => {
            let node = PeerNode::new(cfg.node_options(), store.clone());
            let meta = node.request_file(&peer, &name).await?;
            println!(
                "fetched {}: {} bytes in {} chunks",
                meta.file_name,
                meta.total_size,
                meta.chunk_count()
            );
            if let Some(output) = output {
                reassemble(store, name, output).await?;
            }
            Ok(())
        }
        Command::Reassemble { name, output } => reassemble(store, name, output).await,
        Command::Ping { peer } => {
            let node = PeerNode::new(cfg.node_options(), store);
            let rtt = node.ping(&peer).await?;
            println!("pong from {peer} in {:.1} ms", rtt.as_secs_f64() * 1000.0);
            Ok(())
        }
        Command::Push { name } => {
            let client = bootstrap_client(&cfg)?;
            let sent = client.push_file(&store, &name).await?;
            println!("pushed {sent} chunks of {name} to {}", client.base());
            Ok(())
        }
        Command::Pull { hash } => {
            let client = bootstrap_client(&cfg)?;
            client.pull_chunk(&store, &hash).await?;
            println!("pulled {hash} from {}", client.base());
            Ok(())
        }
    }
}

fn bootstrap_client(cfg: &NodeConfig) -> anyhow::Result<BootstrapClient> {
    let url = cfg
        .bootstrap_url
        .as_deref()
        .context("no bootstrap_url configured (set it in the config file or P2PFS_BOOTSTRAP_URL)")?;
    Ok(BootstrapClient::new(url)?)
}

async fn serve(cfg: &NodeConfig, store: FileStore) -> anyhow::Result<()> {
    let mut node = PeerNode::new(cfg.node_options(), store);
    let addr = node.start().await?;
    if let Some(bootstrap) = &cfg.bootstrap {
        node.join_network(bootstrap);
        tracing::info!(bootstrap = %bootstrap, "registered bootstrap peer");
    }
    tracing::info!(node = %node.id(), addr = %addr, data_dir = %cfg.data_dir.display(), "p2pfs node up");

    shutdown_signal().await?;
    tracing::info!("shutting down");
    node.stop().await;
    Ok(())
}

async fn reassemble(store: FileStore, name: String, output: PathBuf) -> anyhow::Result<()> {
    let shown = output.display().to_string();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let meta = store.read_metadata(&name)?;
        store.reassemble(&meta, &output)?;
        Ok(())
    })
    .await??;
    println!("wrote {shown}");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("waiting for Ctrl-C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
