use std::path::PathBuf;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{error, info};

use gossip_ledger::api;
use gossip_ledger::blockchain::{Blockchain, SharedBlockchain};
use gossip_ledger::config::{NodeConfig, StorageKind};
use gossip_ledger::network::P2PServer;

#[derive(Parser, Debug)]
#[command(version, about = "Proof-of-work ledger node that syncs with its peers")]
struct Args {
    /// Optional TOML config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Where the chain is stored
    #[arg(long)]
    data_path: Option<PathBuf>,
    /// P2P listen port
    #[arg(short, long)]
    port: Option<u16>,
    /// Host to bind the P2P and HTTP listeners to
    #[arg(long)]
    host: Option<String>,
    /// HTTP API port
    #[arg(long)]
    api_port: Option<u16>,
    /// Seed peer to dial at startup, `host:port`; may be repeated
    #[arg(long = "peers", value_name = "ADDR")]
    peers: Vec<String>,
    #[arg(long, value_enum)]
    storage: Option<StorageKind>,
}

impl Args {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(data_path) = self.data_path {
            config.data_path = data_path;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(api_port) = self.api_port {
            config.api_port = api_port;
        }
        if !self.peers.is_empty() {
            config.seed_peers = self.peers;
        }
        if let Some(storage) = self.storage {
            config.storage = storage;
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args = Args::parse();
    let mut config = NodeConfig::load(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut config);
    config.validate()?;

    let store = config
        .open_store()
        .with_context(|| format!("Failed to open storage at {}", config.data_path.display()))?;
    let blockchain = Blockchain::with_storage(store, config.difficulty, config.mining_reward)
        .context("Refusing to start on the stored chain")?;
    info!(
        "Loaded chain of {} blocks from {}",
        blockchain.len(),
        config.data_path.display()
    );

    let node = P2PServer::start(config.p2p_config(), SharedBlockchain::new(blockchain))
        .await
        .context("Failed to start P2P server")?;
    let node_data = web::Data::new(node.clone());

    info!(
        "Starting HTTP server at http://{}:{}",
        config.host, config.api_port
    );

    let server = HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(node_data.clone())
            .configure(api::configure_routes)
    })
    .disable_signals()
    .bind((config.host.as_str(), config.api_port))?
    .run();
    let server_handle = server.handle();

    tokio::select! {
        result = server => result?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            server_handle.stop(true).await;
        }
    }

    node.shutdown().await?;
    info!("Node stopped");
    Ok(())
}
