//! Command-line interface for the spynode.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::signal;

use spynode::logging::{LogFileConfig, parse_level};
use spynode::{
    Config, DiskStorage, Handler, Headers, LoggingConfig, MessagePayload, Network, Node, Tx,
    TxUpdate,
};

#[derive(Parser, Debug)]
#[command(name = "spynode", version = spynode::VERSION, about = "Bitcoin SV light node")]
struct Args {
    /// Network to connect to
    #[arg(long, env = "BITCOIN_NETWORK", default_value = "mainnet")]
    network: Network,

    /// Use the test protocol id for contract markers
    #[arg(long, env = "IS_TEST", default_value_t = true, action = clap::ArgAction::Set)]
    is_test: bool,

    /// Trusted node address, host:port
    #[arg(long, env = "NODE_ADDRESS")]
    node_address: String,

    #[arg(long, env = "NODE_USER_AGENT", default_value = "/Tokenized:0.1.0/")]
    user_agent: String,

    /// First block whose contents are processed
    #[arg(long, env = "START_HASH")]
    start_hash: Option<String>,

    /// Target number of untrusted peers
    #[arg(long, env = "UNTRUSTED_NODES", default_value_t = 25)]
    untrusted_nodes: usize,

    /// Milliseconds before an unconfirmed tx is safe
    #[arg(long, env = "SAFE_TX_DELAY", default_value_t = 2000)]
    safe_tx_delay: u64,

    #[arg(long, env = "SHOTGUN_COUNT", default_value_t = 100)]
    shotgun_count: usize,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 25)]
    max_retries: u32,

    /// Milliseconds between reconnect attempts
    #[arg(long, env = "RETRY_DELAY", default_value_t = 2000)]
    retry_delay: u64,

    #[arg(long, env = "REQUEST_MEMPOOL", default_value_t = true, action = clap::ArgAction::Set)]
    request_mempool: bool,

    /// Storage root directory
    #[arg(long, env = "NODE_STORAGE_ROOT", default_value = "./spynode-data")]
    storage_root: PathBuf,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Logs every notification.
struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle_tx(&self, tx: &Tx) {
        tracing::info!(
            txid = %tx.tx.txid(),
            safe = tx.state.safe,
            confirmed = tx.state.is_confirmed(),
            "Relevant tx"
        );
    }

    async fn handle_tx_update(&self, update: &TxUpdate) {
        tracing::info!(
            txid = %update.txid,
            safe = update.state.safe,
            unsafe_ = update.state.unsafe_,
            cancelled = update.state.cancelled,
            confirmed = update.state.is_confirmed(),
            "Tx update"
        );
    }

    async fn handle_headers(&self, headers: &Headers) {
        tracing::info!(start_height = headers.start_height, "Received {} headers", headers.headers.len());
    }

    async fn handle_in_sync(&self) {
        tracing::info!("Node is in sync");
    }

    async fn handle_message(&self, payload: &MessagePayload) {
        tracing::debug!("Node message: {:?}", payload);
    }
}

fn build_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::new(args.network, args.node_address.clone())
        .with_is_test(args.is_test)
        .with_user_agent(args.user_agent.clone())
        .with_untrusted_count(args.untrusted_nodes)
        .with_safe_tx_delay(Duration::from_millis(args.safe_tx_delay))
        .with_shotgun_count(args.shotgun_count)
        .with_retries(args.max_retries, Duration::from_millis(args.retry_delay))
        .with_request_mempool(args.request_mempool)
        .with_storage_path(args.storage_root.clone());
    if let Some(hash) = args.start_hash.as_deref().filter(|hash| !hash.is_empty()) {
        config = config.with_start_hash_hex(hash)?;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match parse_level(&args.log_level) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let _logging = spynode::init_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file: args.log_dir.clone().map(|log_dir| LogFileConfig {
            log_dir,
            max_files: 10,
        }),
    })?;

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    tracing::info!("Starting spynode {}", spynode::VERSION);
    tracing::info!("Data directory: {}", config.storage_path.display());

    let storage = Arc::new(DiskStorage::new(&config.storage_path)?);
    let node = Arc::new(Node::new(config, storage, None, None)?);
    node.register_handler(Arc::new(LogHandler)).await;
    node.subscribe_contracts().await;

    let mut run = tokio::spawn(node.clone().run());

    tokio::select! {
        result = &mut run => {
            match result? {
                Ok(()) => tracing::info!("Node finished"),
                Err(e) => {
                    tracing::error!("Node failed: {}", e);
                    process::exit(1);
                }
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down");
            node.stop().await;
            if let Err(e) = run.await? {
                tracing::error!("Node failed: {}", e);
            }
        }
    }

    Ok(())
}
