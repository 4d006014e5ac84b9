//! Configuration of the spynode.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::network::constants::USER_AGENT;
use crate::wire::{Hash32, Network};

/// Configuration of the trusted connection and the untrusted pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network to connect to.
    pub network: Network,

    /// Contract markers use the test protocol id.
    pub is_test: bool,

    /// Trusted node address, `host:port`.
    pub node_address: String,

    /// User agent advertised in version messages.
    pub user_agent: String,

    /// First block whose contents are processed. Blocks below it are only tracked by header.
    /// The zero hash processes everything from genesis.
    pub start_hash: Hash32,

    /// Target size of the untrusted pool. Zero disables it.
    pub untrusted_count: usize,

    /// Time an unconfirmed transaction must go without a conflict before it is safe.
    pub safe_tx_delay: Duration,

    /// Number of peers a broadcast transaction should reach.
    pub shotgun_count: usize,

    /// Reconnect attempts after which every further attempt is logged as an error.
    pub max_retries: u32,

    pub retry_delay: Duration,

    /// Ask the trusted node for its mempool once in sync.
    pub request_mempool: bool,

    /// Root directory of disk storage. Defaults to ./spynode-data
    pub storage_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            is_test: true,
            node_address: String::new(),
            user_agent: USER_AGENT.to_string(),
            start_hash: Hash32::all_zeros(),
            untrusted_count: 25,
            safe_tx_delay: Duration::from_millis(2000),
            shotgun_count: 100,
            max_retries: 25,
            retry_delay: Duration::from_millis(2000),
            request_mempool: true,
            storage_path: PathBuf::from("./spynode-data"),
        }
    }
}

impl Config {
    /// Create a configuration for a trusted node on the given network.
    pub fn new(network: Network, node_address: impl Into<String>) -> Self {
        Self {
            network,
            node_address: node_address.into(),
            ..Self::default()
        }
    }

    pub fn mainnet(node_address: impl Into<String>) -> Self {
        Self::new(Network::Mainnet, node_address)
    }

    pub fn testnet(node_address: impl Into<String>) -> Self {
        Self::new(Network::Testnet, node_address)
    }

    pub fn regtest(node_address: impl Into<String>) -> Self {
        Self::new(Network::Regtest, node_address)
    }

    pub fn with_is_test(mut self, is_test: bool) -> Self {
        self.is_test = is_test;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_start_hash(mut self, hash: Hash32) -> Self {
        self.start_hash = hash;
        self
    }

    /// Set the start hash from its hex display form. An empty string keeps the zero hash.
    pub fn with_start_hash_hex(self, hash: &str) -> Result<Self, ConfigError> {
        if hash.trim().is_empty() {
            return Ok(self.with_start_hash(Hash32::all_zeros()));
        }
        let hash = hash
            .trim()
            .parse::<Hash32>()
            .map_err(|e| ConfigError::InvalidStartHash(format!("{}: {}", hash, e)))?;
        Ok(self.with_start_hash(hash))
    }

    pub fn with_untrusted_count(mut self, count: usize) -> Self {
        self.untrusted_count = count;
        self
    }

    pub fn with_safe_tx_delay(mut self, delay: Duration) -> Self {
        self.safe_tx_delay = delay;
        self
    }

    pub fn with_shotgun_count(mut self, count: usize) -> Self {
        self.shotgun_count = count;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_request_mempool(mut self, request: bool) -> Self {
        self.request_mempool = request;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// The trusted node address with the host hidden, for logs.
    pub fn masked_address(&self) -> String {
        masked_address(&self.node_address)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_address.trim().is_empty() {
            return Err(ConfigError::Invalid("node address is required".to_string()));
        }

        let port = self.node_address.rsplit_once(':').map(|(_, port)| port);
        if port.is_none_or(|port| port.parse::<u16>().is_err()) {
            return Err(ConfigError::Invalid(format!(
                "node address {} must include a port",
                masked_address(&self.node_address)
            )));
        }

        Ok(())
    }
}

/// Replaces the host with asterisks, keeping the port.
fn masked_address(address: &str) -> String {
    match address.rsplit_once(':') {
        Some((_, port)) => format!("***:{}", port),
        None => "***".to_string(),
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Network:{} IsTest:{} NodeAddress:{} UserAgent:{} StartHash:{} UntrustedCount:{} \
             SafeTxDelay:{}ms ShotgunCount:{} MaxRetries:{} RetryDelay:{}ms RequestMempool:{}}}",
            self.network,
            self.is_test,
            masked_address(&self.node_address),
            self.user_agent,
            self.start_hash,
            self.untrusted_count,
            self.safe_tx_delay.as_millis(),
            self.shotgun_count,
            self.max_retries,
            self.retry_delay.as_millis(),
            self.request_mempool
        )
    }
}
