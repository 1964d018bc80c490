//! Goldchain CLI Application
//!
//! Runs the P2P node and inspects the local header store.

use clap::{Parser, Subcommand};
use goldchain::core::BlockHash;
use goldchain::network::{
    network_data_dir, Network, Node, NodeConfig, DEFAULT_DATA_DIR, MAX_PEERS,
};
use goldchain::storage::{
    BlockBodyStore, FileBodyStore, FileHeaderStore, HeaderStore, StorageConfig,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "goldchain")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A Bitcoin-protocol header-chain node", long_about = None)]
struct Cli {
    /// Base data directory; networks other than main use a subdirectory
    #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Network to join (main, testnet, regtest, signet)
    #[arg(short, long, default_value = "main")]
    network: Network,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the P2P node
    Start {
        /// Port to listen on (defaults to the network's port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Accept inbound connections
        #[arg(long)]
        listen: bool,

        /// Maximum number of live peers
        #[arg(long, default_value_t = MAX_PEERS)]
        max_peers: usize,

        /// Initial peers to connect to (comma-separated host[:port])
        #[arg(long)]
        peers: Option<String>,

        /// Extra DNS seeds (comma-separated)
        #[arg(long)]
        seeds: Option<String>,

        /// Skip the built-in DNS seeds
        #[arg(long)]
        no_default_seeds: bool,

        /// Seconds between status lines
        #[arg(long, default_value = "60")]
        status_interval: u64,
    },

    /// Display chain information from the local store
    Info,

    /// Show a stored header by height or hash
    Header {
        /// Block height or block hash
        id: String,
    },
}

fn split_list(list: &Option<String>) -> Vec<String> {
    list.as_deref()
        .map(|p| {
            p.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let data_dir = network_data_dir(&cli.data_dir, cli.network);

    match &cli.command {
        Commands::Start {
            port,
            listen,
            max_peers,
            peers,
            seeds,
            no_default_seeds,
            status_interval,
        } => {
            let mut config = NodeConfig::for_network(cli.network);
            config.data_dir = data_dir;
            config.listen = *listen;
            config.max_peers = *max_peers;
            config.bootstrap_peers = split_list(peers);
            if let Some(port) = port {
                config.port = *port;
            }
            if *no_default_seeds {
                config.seeds.clear();
            }
            config.seeds.extend(split_list(seeds));

            run_node(config, Duration::from_secs((*status_interval).max(1)))
        }
        Commands::Info => cmd_info(&data_dir),
        Commands::Header { id } => cmd_header(&data_dir, id),
    }
}

fn run_node(config: NodeConfig, status_interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        log::info!(
            "Starting {} node (data dir {})",
            config.network,
            config.data_dir.display()
        );
        let node = Node::start(config).await?;

        let mut status_tick = tokio::time::interval(status_interval);
        let run = node.run();
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => {
                    result?;
                    break;
                }
                _ = status_tick.tick() => match node.status().await {
                    Ok(status) => log::info!(
                        "Height {:?}, tip {}, {} orphans, {}/{} peers alive, {} addresses{}",
                        status.height,
                        status.tip.map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
                        status.orphans,
                        status.alive_peers,
                        status.peers,
                        status.addresses,
                        if status.syncing { ", syncing" } else { "" }
                    ),
                    Err(e) => log::warn!("Status unavailable: {}", e),
                },
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutting down node...");
                    node.shutdown().await;
                    break;
                }
            }
        }

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn open_headers(data_dir: &Path) -> Result<FileHeaderStore, Box<dyn std::error::Error>> {
    Ok(FileHeaderStore::open(&StorageConfig::with_data_dir(data_dir))?)
}

fn cmd_info(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let headers = open_headers(data_dir)?;

    println!("Header store: {}", headers.path().display());
    println!("Headers:      {}", headers.len());
    match headers.tip()? {
        Some(tip) => {
            println!("Height:       {}", tip.height);
            println!("Tip:          {}", tip.hash);
            println!("Bits:         {:#010x}", tip.header.bits);
        }
        None => println!("Chain is empty; run `goldchain start` to bootstrap it."),
    }
    Ok(())
}

fn cmd_header(data_dir: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let headers = open_headers(data_dir)?;
    let stored = match id.parse::<u64>() {
        Ok(height) => headers.get_by_height(height)?,
        Err(_) => headers.get_by_hash(&id.parse::<BlockHash>()?)?,
    };

    let Some(stored) = stored else {
        println!("No header {}", id);
        return Ok(());
    };

    let bodies = FileBodyStore::open(&StorageConfig::with_data_dir(data_dir))?;
    let header = stored.header;
    println!("Height:      {}", stored.height);
    println!("Hash:        {}", stored.hash);
    println!("Version:     {}", header.version);
    println!("Previous:    {}", header.prev_hash);
    println!("Merkle root: {}", header.merkle_root);
    println!("Time:        {}", header.time);
    println!("Bits:        {:#010x}", header.bits);
    println!("Nonce:       {}", header.nonce);
    match bodies.get_body(&stored.hash)? {
        Some(txs) => println!("Body:        {} transactions", txs.len()),
        None => println!("Body:        headers only"),
    }
    Ok(())
}
