//! Configuration management for fibercoin
//!
//! Every field has a default matching the mainnet parameters, so an absent
//! or partial `config.toml` still yields a complete configuration.

use crate::blockchain::{GenesisParams, LedgerParams, PublicKeyAuthority};
use crate::coin::{DROPLETS_PER_COIN, DROPLET_DECIMALS};
use crate::crypto::{public_key_from_hex, Address, KeyPair};
use crate::distribution::{
    parse_addresses, Distribution, LockPolicy, MAINNET_DISTRIBUTION_ADDRESSES,
    MAINNET_INITIAL_UNLOCKED_COUNT, MAINNET_MAX_COIN_SUPPLY, MAINNET_UNLOCK_ADDRESS_RATE,
    MAINNET_UNLOCK_TIME_INTERVAL,
};
use crate::error::{ChainError, Result};
use crate::mempool::PoolConfig;
use crate::transaction::VerifyParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

pub const ENV_BURN_FACTOR: &str = "USER_BURN_FACTOR";
pub const ENV_MAX_TXN_SIZE: &str = "USER_MAX_TXN_SIZE";
pub const ENV_MAX_DECIMALS: &str = "USER_MAX_DECIMALS";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    /// Rules for transactions entering the unconfirmed pool.
    #[serde(default)]
    pub unconfirmed: VerifyParams,
    /// Rules for transactions inside blocks.
    #[serde(default)]
    pub create_block: VerifyParams,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default = "default_coin_name")]
    pub coin_name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_db_file")]
    pub db_file: String,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Seconds between publishing attempts when a block signing key is set.
    #[serde(default = "default_publish_interval_secs")]
    pub publish_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            coin_name: default_coin_name(),
            data_dir: default_data_dir(),
            db_file: default_db_file(),
            api_host: default_api_host(),
            api_port: default_api_port(),
            publish_interval_secs: default_publish_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainConfig {
    #[serde(default = "default_genesis_address")]
    pub genesis_address: String,
    /// Droplets.
    #[serde(default = "default_genesis_coin_volume")]
    pub genesis_coin_volume: u64,
    #[serde(default = "default_genesis_timestamp")]
    pub genesis_timestamp: u64,
    /// Hex compressed public key of the block publisher.
    #[serde(default = "default_blockchain_pubkey")]
    pub blockchain_pubkey: String,
    /// Hex secret key. Only set on the publishing node.
    #[serde(default)]
    pub blockchain_seckey: Option<String>,
    #[serde(default = "default_max_block_transactions_size")]
    pub max_block_transactions_size: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            genesis_address: default_genesis_address(),
            genesis_coin_volume: default_genesis_coin_volume(),
            genesis_timestamp: default_genesis_timestamp(),
            blockchain_pubkey: default_blockchain_pubkey(),
            blockchain_seckey: None,
            max_block_transactions_size: default_max_block_transactions_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DistributionConfig {
    /// Whole coins.
    #[serde(default = "default_max_coin_supply")]
    pub max_coin_supply: u64,
    #[serde(default = "default_initial_unlocked_count")]
    pub initial_unlocked_count: u64,
    #[serde(default = "default_unlock_address_rate")]
    pub unlock_address_rate: u64,
    #[serde(default = "default_unlock_time_interval")]
    pub unlock_time_interval: u64,
    #[serde(default = "default_distribution_addresses")]
    pub addresses: Vec<String>,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig {
            max_coin_supply: default_max_coin_supply(),
            initial_unlocked_count: default_initial_unlocked_count(),
            unlock_address_rate: default_unlock_address_rate(),
            unlock_time_interval: default_unlock_time_interval(),
            addresses: default_distribution_addresses(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Applies `USER_*` overrides from the process environment to the
    /// unconfirmed pool rules.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_BURN_FACTOR) {
            self.unconfirmed.burn_factor = parse_override(ENV_BURN_FACTOR, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_TXN_SIZE) {
            self.unconfirmed.max_transaction_size = parse_override(ENV_MAX_TXN_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_DECIMALS) {
            self.unconfirmed.max_droplet_precision = parse_override(ENV_MAX_DECIMALS, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let max_block = self.chain.max_block_transactions_size;
        validate_verify_params("unconfirmed", &self.unconfirmed, max_block)?;
        validate_verify_params("create_block", &self.create_block, max_block)?;

        if self.chain.genesis_coin_volume == 0 {
            return Err(ChainError::ConfigError(
                "chain.genesis_coin_volume must be positive".to_string(),
            ));
        }

        let distribution = self.distribution()?;
        distribution.validate()?;
        if !distribution.is_empty() {
            let supply = distribution
                .max_coin_supply
                .saturating_mul(DROPLETS_PER_COIN);
            if supply != self.chain.genesis_coin_volume {
                return Err(ChainError::ConfigError(format!(
                    "genesis coin volume {} does not equal the distribution supply {} droplets",
                    self.chain.genesis_coin_volume, supply
                )));
            }
        }

        self.genesis()?;
        let authority = self.authority()?;
        if let Some(keypair) = self.publisher_key()? {
            if &keypair.public_key != authority.public_key() {
                return Err(ChainError::ConfigError(
                    "chain.blockchain_seckey does not match chain.blockchain_pubkey".to_string(),
                ));
            }
        }

        if self.node.data_dir.is_empty() {
            return Err(ChainError::ConfigError(
                "node.data_dir must be set".to_string(),
            ));
        }
        if self.pool.max_transactions == 0 {
            return Err(ChainError::ConfigError(
                "pool.max_transactions must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn distribution(&self) -> Result<Distribution> {
        let d = &self.distribution;
        Ok(Distribution {
            max_coin_supply: d.max_coin_supply,
            initial_unlocked_count: d.initial_unlocked_count,
            unlock_address_rate: d.unlock_address_rate,
            unlock_time_interval: d.unlock_time_interval,
            addresses: parse_addresses(d.addresses.iter().map(String::as_str))?,
        })
    }

    pub fn lock_policy(&self) -> Result<LockPolicy> {
        Ok(LockPolicy::new(
            self.distribution()?,
            self.chain.genesis_timestamp,
        ))
    }

    pub fn genesis(&self) -> Result<GenesisParams> {
        let address: Address = self.chain.genesis_address.parse()?;
        Ok(GenesisParams {
            address,
            coin_volume: self.chain.genesis_coin_volume,
            timestamp: self.chain.genesis_timestamp,
        })
    }

    pub fn authority(&self) -> Result<PublicKeyAuthority> {
        Ok(PublicKeyAuthority::new(public_key_from_hex(
            &self.chain.blockchain_pubkey,
        )?))
    }

    /// Block signing key, if this node publishes blocks.
    pub fn publisher_key(&self) -> Result<Option<KeyPair>> {
        match &self.chain.blockchain_seckey {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => {
                let bytes = hex::decode(s).map_err(|e| {
                    ChainError::ConfigError(format!("chain.blockchain_seckey is not hex: {}", e))
                })?;
                Ok(Some(KeyPair::from_secret_bytes(&bytes)?))
            }
        }
    }

    pub fn ledger_params(&self) -> LedgerParams {
        LedgerParams {
            verify: self.create_block,
            max_block_transactions_size: self.chain.max_block_transactions_size,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.node.data_dir).join(&self.node.db_file)
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.node.api_host, self.node.api_port)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ChainError::ConfigError(format!("invalid {}={:?}: {}", key, value, e)))
}

fn validate_verify_params(section: &str, p: &VerifyParams, max_block: usize) -> Result<()> {
    if p.burn_factor < 2 {
        return Err(ChainError::ConfigError(format!(
            "{}.burn_factor must be at least 2, got {}",
            section, p.burn_factor
        )));
    }
    if p.max_droplet_precision > DROPLET_DECIMALS {
        return Err(ChainError::ConfigError(format!(
            "{}.max_droplet_precision must be at most {}, got {}",
            section, DROPLET_DECIMALS, p.max_droplet_precision
        )));
    }
    if p.max_transaction_size == 0 || p.max_transaction_size > max_block {
        return Err(ChainError::ConfigError(format!(
            "{}.max_transaction_size {} must be between 1 and the block limit {}",
            section, p.max_transaction_size, max_block
        )));
    }
    Ok(())
}

/// Loads `path`, or `config.toml` in the working directory when no path is
/// given. A missing default file falls back to built-in defaults; a missing
/// explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => {
            let raw = fs::read_to_string(p).map_err(|e| {
                ChainError::ConfigError(format!("cannot read {}: {}", p.display(), e))
            })?;
            Config::from_toml_str(&raw)?
        }
        None => match fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Ok(raw) => Config::from_toml_str(&raw)?,
            Err(_) => {
                info!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                Config::default()
            }
        },
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn default_coin_name() -> String {
    "fibercoin".to_string()
}

fn default_data_dir() -> String {
    dirs::home_dir()
        .map(|h| h.join(".fibercoin"))
        .unwrap_or_else(|| PathBuf::from(".fibercoin"))
        .to_string_lossy()
        .into_owned()
}

fn default_db_file() -> String {
    "data.db".to_string()
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    6420
}

fn default_publish_interval_secs() -> u64 {
    10
}

fn default_genesis_address() -> String {
    "24GJTLPMoz61sV4J4qg1n14x5qqDwXqyJJy".to_string()
}

fn default_genesis_coin_volume() -> u64 {
    MAINNET_MAX_COIN_SUPPLY * DROPLETS_PER_COIN
}

fn default_genesis_timestamp() -> u64 {
    1_637_895_025
}

fn default_blockchain_pubkey() -> String {
    "02933015bd2fa1e0a885c05fb08eb7c647bf8c3188ed5120b51d0d09ccaf525036".to_string()
}

fn default_max_block_transactions_size() -> usize {
    crate::blockchain::DEFAULT_MAX_BLOCK_TRANSACTIONS_SIZE
}

fn default_max_coin_supply() -> u64 {
    MAINNET_MAX_COIN_SUPPLY
}

fn default_initial_unlocked_count() -> u64 {
    MAINNET_INITIAL_UNLOCKED_COUNT
}

fn default_unlock_address_rate() -> u64 {
    MAINNET_UNLOCK_ADDRESS_RATE
}

fn default_unlock_time_interval() -> u64 {
    MAINNET_UNLOCK_TIME_INTERVAL
}

fn default_distribution_addresses() -> Vec<String> {
    MAINNET_DISTRIBUTION_ADDRESSES
        .iter()
        .map(|s| s.to_string())
        .collect()
}
