//! Genesis distribution table and its unlock schedule
//!
//! The coin supply is split evenly between a fixed list of addresses at
//! genesis. Addresses become spendable in table order: a first batch at
//! genesis, then `unlock_address_rate` more every `unlock_time_interval`
//! seconds.

use crate::coin::DROPLETS_PER_COIN;
use crate::crypto::Address;
use crate::error::{ChainError, Result};
use std::collections::{HashMap, HashSet};

/// Mainnet distribution addresses, in unlock order.
pub const MAINNET_DISTRIBUTION_ADDRESSES: [&str; 10] = [
    "yDctMREirofdnxEgZLVJwaZdEb9Em1bJyk",
    "L7JU5g8zkfg3q24yqJSojSzRAZc1dbUJn5",
    "hY5By3kHpwWp3a5VnDCyrJGtPFAnnPMrqS",
    "XTRghTPUUfiz9P3LUWaBRpT7LFoTR9jSAH",
    "a5NctjK7wkpXw17adFFSYRAYcJps2FEEhQ",
    "2MSeuyaReBbyePioGhpWoQStX8W9MPAZgTu",
    "7gbFAfL6XA5Wkpa3VjiwjhZNv4HeDzgrQ3",
    "29377Ntb9C2AgumgABigzoq1RdGJDXauBEP",
    "5o7zPhehRerBP2JexqwfUAyQiqzQKsbcod",
    "2fknwEypYS8WafAd3AJgv6vAm2QtiahU5Vx",
];

pub const MAINNET_MAX_COIN_SUPPLY: u64 = 165_000_000;
pub const MAINNET_INITIAL_UNLOCKED_COUNT: u64 = 100;
pub const MAINNET_UNLOCK_ADDRESS_RATE: u64 = 5;
/// One year.
pub const MAINNET_UNLOCK_TIME_INTERVAL: u64 = 60 * 60 * 24 * 365;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    /// Whole coins, not droplets.
    pub max_coin_supply: u64,
    pub initial_unlocked_count: u64,
    pub unlock_address_rate: u64,
    pub unlock_time_interval: u64,
    pub addresses: Vec<Address>,
}

impl Distribution {
    pub fn mainnet() -> Result<Self> {
        let addresses = parse_addresses(MAINNET_DISTRIBUTION_ADDRESSES.iter().copied())?;
        Ok(Distribution {
            max_coin_supply: MAINNET_MAX_COIN_SUPPLY,
            initial_unlocked_count: MAINNET_INITIAL_UNLOCKED_COUNT,
            unlock_address_rate: MAINNET_UNLOCK_ADDRESS_RATE,
            unlock_time_interval: MAINNET_UNLOCK_TIME_INTERVAL,
            addresses,
        })
    }

    /// A table with no addresses. Nothing is ever locked.
    pub fn empty(max_coin_supply: u64) -> Self {
        Distribution {
            max_coin_supply,
            initial_unlocked_count: 0,
            unlock_address_rate: 0,
            unlock_time_interval: 0,
            addresses: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Whole coins assigned to each distribution address at genesis.
    pub fn address_initial_balance(&self) -> u64 {
        if self.addresses.is_empty() {
            return 0;
        }
        self.max_coin_supply / self.addresses.len() as u64
    }

    pub fn address_initial_balance_droplets(&self) -> Option<u64> {
        self.address_initial_balance().checked_mul(DROPLETS_PER_COIN)
    }

    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Ok(());
        }

        if self.max_coin_supply % self.addresses.len() as u64 != 0 {
            return Err(ChainError::ConfigError(format!(
                "max coin supply {} is not divisible by {} distribution addresses",
                self.max_coin_supply,
                self.addresses.len()
            )));
        }

        if self.max_coin_supply.checked_mul(DROPLETS_PER_COIN).is_none() {
            return Err(ChainError::ConfigError(
                "max coin supply overflows when expressed in droplets".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.addresses.len());
        for address in &self.addresses {
            if !seen.insert(address) {
                return Err(ChainError::ConfigError(format!(
                    "duplicate distribution address {}",
                    address
                )));
            }
        }

        if self.unlock_address_rate > 0 && self.unlock_time_interval == 0 {
            return Err(ChainError::ConfigError(
                "unlock_time_interval must be positive when unlock_address_rate is set"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

pub fn parse_addresses<'a, I>(addresses: I) -> Result<Vec<Address>>
where
    I: IntoIterator<Item = &'a str>,
{
    addresses
        .into_iter()
        .map(|s| {
            s.parse::<Address>()
                .map_err(|e| ChainError::InvalidAddress(format!("{}: {}", s, e)))
        })
        .collect()
}

/// Answers whether a distribution address may spend at a given time.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    distribution: Distribution,
    genesis_timestamp: u64,
    index: HashMap<Address, usize>,
}

impl LockPolicy {
    pub fn new(distribution: Distribution, genesis_timestamp: u64) -> Self {
        let mut index = HashMap::with_capacity(distribution.addresses.len());
        for (i, address) in distribution.addresses.iter().enumerate() {
            index.entry(*address).or_insert(i);
        }
        LockPolicy {
            distribution,
            genesis_timestamp,
            index,
        }
    }

    /// A policy that never locks anything.
    pub fn unrestricted() -> Self {
        Self::new(Distribution::empty(0), 0)
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn genesis_timestamp(&self) -> u64 {
        self.genesis_timestamp
    }

    /// Number of leading table entries that are spendable at `current_time`.
    pub fn unlocked_count(&self, current_time: u64) -> usize {
        let d = &self.distribution;
        let elapsed = current_time.saturating_sub(self.genesis_timestamp);
        let periods = if d.unlock_time_interval == 0 {
            0
        } else {
            elapsed / d.unlock_time_interval
        };
        let unlocked = d
            .initial_unlocked_count
            .saturating_add(d.unlock_address_rate.saturating_mul(periods));
        usize::try_from(unlocked)
            .unwrap_or(usize::MAX)
            .min(d.addresses.len())
    }

    pub fn is_locked(&self, address: &Address, current_time: u64) -> bool {
        match self.index.get(address) {
            Some(&i) => i >= self.unlocked_count(current_time),
            None => false,
        }
    }

    /// Whether any of `addresses` is locked at `current_time`.
    pub fn any_locked<'a, I>(&self, addresses: I, current_time: u64) -> bool
    where
        I: IntoIterator<Item = &'a Address>,
    {
        addresses
            .into_iter()
            .any(|a| self.is_locked(a, current_time))
    }

    pub fn locked_addresses(&self, current_time: u64) -> Vec<Address> {
        let n = self.unlocked_count(current_time);
        self.distribution.addresses[n..].to_vec()
    }

    pub fn unlocked_addresses(&self, current_time: u64) -> Vec<Address> {
        let n = self.unlocked_count(current_time);
        self.distribution.addresses[..n].to_vec()
    }

    /// Timestamp at which the next batch of addresses unlocks, if any remain locked.
    pub fn next_unlock_time(&self, current_time: u64) -> Option<u64> {
        let d = &self.distribution;
        if self.unlocked_count(current_time) >= d.addresses.len()
            || d.unlock_address_rate == 0
            || d.unlock_time_interval == 0
        {
            return None;
        }
        let elapsed = current_time.saturating_sub(self.genesis_timestamp);
        let next_period = elapsed / d.unlock_time_interval + 1;
        next_period
            .checked_mul(d.unlock_time_interval)
            .and_then(|offset| self.genesis_timestamp.checked_add(offset))
    }
}
