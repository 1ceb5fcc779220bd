//! kayak node binary

use anyhow::Context as _;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use kayak::common::{Config, Context};
use kayak::peers::{Peers, PrivateKey, Server};
use kayak::transport::{NetworkTransport, TcpStreamLayer, TransportConfig};
use kayak::{Runtime, RuntimeConfig, TwoPcConfig, Worker};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kayak-node")]
#[command(about = "kayak replicated-write node", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an operator key pair
    Keygen {
        /// Where to write the hex private key
        #[arg(long)]
        out: PathBuf,
    },

    /// Sign an unsigned cluster description into a peer file
    SignPeers {
        /// Hex private key file
        #[arg(long)]
        key: PathBuf,

        /// Cluster description: {"term": N, "servers": [{"id", "role"}]}
        #[arg(long)]
        input: PathBuf,

        /// Signed peer file to write
        #[arg(long, default_value = "./peers.json")]
        out: PathBuf,
    },

    /// Check a peer file's shape and signature
    VerifyPeers {
        #[arg(long, default_value = "./peers.json")]
        peers: PathBuf,
    },

    /// Run a node. On the leader, every stdin line is applied as one write.
    Serve {
        /// Node config (TOML)
        #[arg(long, default_value = "./kayak.toml")]
        config: PathBuf,
    },
}

#[derive(Deserialize)]
struct ClusterFile {
    term: u64,
    servers: Vec<Server>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { out } => {
            init_tracing("info");
            let key = PrivateKey::generate();
            std::fs::write(&out, key.to_hex())
                .with_context(|| format!("writing {}", out.display()))?;
            println!("public key: {}", key.public_key().to_hex());
        }

        Commands::SignPeers { key, input, out } => {
            init_tracing("info");
            let key = PrivateKey::from_hex(&std::fs::read_to_string(&key)?)?;
            let cluster: ClusterFile = serde_json::from_slice(&std::fs::read(&input)?)
                .with_context(|| format!("parsing {}", input.display()))?;

            let mut peers = Peers::new(cluster.term, cluster.servers);
            peers.sign(&key)?;
            peers.verify()?;
            peers.save(&out)?;
            tracing::info!("Signed term {} peer set into {}", peers.term, out.display());
        }

        Commands::VerifyPeers { peers } => {
            init_tracing("info");
            let peers = Peers::load(&peers)?;
            peers.verify()?;
            println!("term:   {}", peers.term);
            println!("digest: {}", peers.digest()?);
            for server in &peers.servers {
                println!("  {} ({})", server.id, server.role);
            }
        }

        Commands::Serve { config } => {
            let config = Config::load(&config)?;
            init_tracing(&config.log_level);
            serve(config).await?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let local = config.local_id();
    let peers = Peers::load(&config.peers_file)
        .with_context(|| format!("loading {}", config.peers_file.display()))?;

    tracing::info!("Starting node: {}", local);
    tracing::info!("  Transport: {}", config.bind_addr);
    tracing::info!("  Root dir: {}", config.root_dir.display());
    tracing::info!("  Peers: {}", config.peers_file.display());

    std::fs::create_dir_all(&config.root_dir)?;
    let worker = Arc::new(JournalWorker::open(config.root_dir.join("journal.log"))?);

    let stream = TcpStreamLayer::bind(local.clone(), config.bind_addr, config.address_book()).await?;
    let transport = Arc::new(NetworkTransport::new(TransportConfig::new(
        local.clone(),
        stream,
    )));
    let mut runtime_config = RuntimeConfig::new(&config.root_dir, local, transport);
    runtime_config.process_timeout = config.process_timeout()?;

    let runtime = Runtime::new(
        TwoPcConfig {
            runtime: runtime_config,
            storage: worker,
        },
        peers,
    )?;
    runtime.init().await?;

    if runtime.is_leader() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match runtime.apply(line).await {
                Ok(applied) => println!(
                    "{} {}",
                    applied.log.index,
                    String::from_utf8_lossy(&applied.result)
                ),
                Err(e) => tracing::error!("Apply failed: {}", e),
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    runtime.shutdown().await?;
    Ok(())
}

/// Appends each committed write as one line of a journal file.
/// Commit returns the number of entries journaled so far.
struct JournalWorker {
    path: PathBuf,
    staged: Mutex<Vec<Vec<u8>>>,
    committed: AtomicU64,
}

impl JournalWorker {
    fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let committed = match std::fs::read(&path) {
            Ok(bytes) => bytes.iter().filter(|b| **b == b'\n').count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            staged: Mutex::new(Vec::new()),
            committed: AtomicU64::new(committed),
        })
    }

    /// Remove one staged copy of `data`. False if it was never staged.
    fn unstage(&self, data: &[u8]) -> bool {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        match staged.iter().position(|s| s == data) {
            Some(pos) => {
                staged.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Worker for JournalWorker {
    async fn prepare(&self, _ctx: &Context, data: &[u8]) -> kayak::Result<()> {
        if data.contains(&b'\n') {
            return Err(kayak::Error::Other("journal entries are single lines".into()));
        }
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
        Ok(())
    }

    async fn commit(&self, _ctx: &Context, data: &[u8]) -> kayak::Result<Vec<u8>> {
        if !self.unstage(data) {
            return Err(kayak::Error::Other("commit of an unprepared entry".into()));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = data.to_vec();
        line.push(b'\n');
        file.write_all(&line).await?;
        file.sync_data().await?;

        let count = self.committed.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(count.to_string().into_bytes())
    }

    async fn rollback(&self, _ctx: &Context, data: &[u8]) -> kayak::Result<()> {
        self.unstage(data);
        Ok(())
    }
}
