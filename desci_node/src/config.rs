//! Node configuration
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `DESCI__SECTION__KEY` environment variables, then the plain variable
//! names the platform's deployment scripts export (`ETHEREUM_RPC`,
//! `START_BLOCK`, `RESEARCH_NFT_ADDRESS`, ...). CLI flags are applied last
//! by the binary.

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::verify::HashAlgorithm;

/// Name of the listener created when none are configured explicitly
pub const DEFAULT_LISTENER: &str = "desci";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Blocks behind head before a block is treated as final
    pub confirmations: u64,
    pub poll_interval_ms: u64,
    pub max_block_range: u64,
    pub rpc_timeout_ms: u64,
    /// First block to scan when a listener has no checkpoint yet
    pub start_block: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            confirmations: 2,
            poll_interval_ms: 3000,
            max_block_range: 1000,
            rpc_timeout_ms: 10_000,
            start_block: 0,
        }
    }
}

impl ChainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per RPC call before the cycle fails
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Failed cycles in a row before a listener goes to FAILED
    pub max_consecutive_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_consecutive_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/desci".to_string(),
        }
    }
}

/// Deployed contract addresses; empty entries are ignored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractsConfig {
    pub registry: Option<String>,
    pub research_nft: Option<String>,
    pub dataset_manager: Option<String>,
    pub influence_ranking: Option<String>,
    pub platform: Option<String>,
}

impl ContractsConfig {
    pub fn addresses(&self) -> Vec<String> {
        [
            &self.registry,
            &self.research_nft,
            &self.dataset_manager,
            &self.influence_ranking,
            &self.platform,
        ]
        .into_iter()
        .flatten()
        .filter(|a| !a.trim().is_empty())
        .cloned()
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    pub contracts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub api: ApiConfig,
    pub chain: ChainConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub contracts: ContractsConfig,
    pub listeners: Vec<ListenerConfig>,
    pub verify: VerifyConfig,
}

impl NodeConfig {
    /// Load configuration from an optional YAML file plus the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("DESCI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        let mut cfg: NodeConfig = settings
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        cfg.apply_legacy_env();
        Ok(cfg)
    }

    fn apply_legacy_env(&mut self) {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
            self.api.port = port;
        }
        if let Some(rpc) = var("ETHEREUM_RPC") {
            self.chain.rpc_url = rpc;
        }
        if let Some(start) = var("START_BLOCK").and_then(|v| v.parse().ok()) {
            self.chain.start_block = start;
        }
        let contracts = &mut self.contracts;
        for (key, slot) in [
            ("DESCI_REGISTRY_ADDRESS", &mut contracts.registry),
            ("RESEARCH_NFT_ADDRESS", &mut contracts.research_nft),
            ("DATASET_MANAGER_ADDRESS", &mut contracts.dataset_manager),
            ("INFLUENCE_RANKING_ADDRESS", &mut contracts.influence_ranking),
            ("DESCI_PLATFORM_ADDRESS", &mut contracts.platform),
        ] {
            if let Some(addr) = var(key) {
                *slot = Some(addr);
            }
        }
    }

    /// Listeners to run. Without explicit entries a single listener
    /// multiplexes every configured contract.
    pub fn effective_listeners(&self) -> Vec<ListenerConfig> {
        if !self.listeners.is_empty() {
            return self.listeners.clone();
        }
        let contracts = self.contracts.addresses();
        if contracts.is_empty() {
            return Vec::new();
        }
        vec![ListenerConfig {
            name: DEFAULT_LISTENER.to_string(),
            contracts,
        }]
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain.rpc_url.trim().is_empty() {
            return Err(SyncError::Config("chain.rpc_url must not be empty".into()));
        }
        if self.chain.max_block_range == 0 {
            return Err(SyncError::Config("chain.max_block_range must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.api.max_page_size == 0 || self.api.default_page_size > self.api.max_page_size {
            return Err(SyncError::Config(format!(
                "api.default_page_size {} must be within 1..={}",
                self.api.default_page_size, self.api.max_page_size
            )));
        }

        let mut names = std::collections::HashSet::new();
        for listener in self.effective_listeners() {
            if !names.insert(listener.name.clone()) {
                return Err(SyncError::Config(format!(
                    "duplicate listener name {}",
                    listener.name
                )));
            }
            for addr in &listener.contracts {
                Address::from_str(addr).map_err(|e| {
                    SyncError::Config(format!("invalid contract address {addr}: {e}"))
                })?;
            }
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| SyncError::Config(e.to_string()))
    }
}
