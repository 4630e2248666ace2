use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::swap::Asset;
use crate::swap::service::Policy;

/// Confirmation depth and reclaim delay used for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub confirmations: u32,
    pub csv: u32,
}

impl ChainParams {
    pub const BITCOIN: Self = Self {
        confirmations: 3,
        csv: 1008,
    };
    pub const LIQUID: Self = Self {
        confirmations: 2,
        csv: 60,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store_path: PathBuf,
    pub retry_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub chain_poll_interval_secs: u64,

    pub bitcoin_enabled: bool,
    pub liquid_enabled: bool,
    pub bitcoin: ChainParams,
    pub liquid: ChainParams,
    /// Only this Liquid asset is swapped when set.
    pub liquid_asset_id: Option<String>,

    pub allowlisted_peers: Vec<String>,
    pub accept_all_peers: bool,
    pub allow_new_swaps: bool,
    pub min_swap_amount_sat: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("swaps.sqlite3"),
            retry_interval_secs: 10,
            poll_interval_secs: 10,
            chain_poll_interval_secs: 10,
            bitcoin_enabled: true,
            liquid_enabled: true,
            bitcoin: ChainParams::BITCOIN,
            liquid: ChainParams::LIQUID,
            liquid_asset_id: None,
            allowlisted_peers: Vec::new(),
            accept_all_peers: false,
            allow_new_swaps: true,
            min_swap_amount_sat: 100_000,
        }
    }
}

impl Config {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<Config>(&raw)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read config {}", path.display()));
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.retry_interval_secs > 0, "retry_interval_secs must be > 0");
        anyhow::ensure!(self.poll_interval_secs > 0, "poll_interval_secs must be > 0");
        anyhow::ensure!(
            self.chain_poll_interval_secs > 0,
            "chain_poll_interval_secs must be > 0"
        );
        for (name, params) in [("bitcoin", self.bitcoin), ("liquid", self.liquid)] {
            anyhow::ensure!(params.confirmations > 0, "{name}.confirmations must be > 0");
            anyhow::ensure!(params.csv > 0, "{name}.csv must be > 0");
        }
        if let Some(asset_id) = &self.liquid_asset_id {
            let bytes = hex::decode(asset_id).context("decode liquid_asset_id")?;
            anyhow::ensure!(bytes.len() == 32, "liquid_asset_id must be 32 bytes");
        }
        Ok(())
    }

    pub fn chain_params(&self, asset: &Asset) -> ChainParams {
        match asset {
            Asset::Btc => self.bitcoin,
            Asset::Liquid(_) => self.liquid,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn chain_poll_interval(&self) -> Duration {
        Duration::from_secs(self.chain_poll_interval_secs)
    }

    /// Asset names announced in poll messages.
    pub fn supported_assets(&self) -> Vec<String> {
        let mut assets = Vec::new();
        if self.bitcoin_enabled {
            assets.push("btc".to_string());
        }
        if self.liquid_enabled {
            assets.push("lbtc".to_string());
        }
        assets
    }
}

/// [`Policy`] backed by the node config, with runtime toggles for the
/// allowlist and new swap acceptance.
#[derive(Debug)]
pub struct ConfigPolicy {
    accept_all_peers: bool,
    bitcoin_enabled: bool,
    liquid_enabled: bool,
    liquid_asset_id: Option<String>,
    min_swap_amount_sat: u64,
    allow_new_swaps: AtomicBool,
    allowlist: Mutex<HashSet<String>>,
    suspicious: Mutex<HashSet<String>>,
}

impl ConfigPolicy {
    pub fn new(cfg: &Config) -> Self {
        Self {
            accept_all_peers: cfg.accept_all_peers,
            bitcoin_enabled: cfg.bitcoin_enabled,
            liquid_enabled: cfg.liquid_enabled,
            liquid_asset_id: cfg.liquid_asset_id.clone(),
            min_swap_amount_sat: cfg.min_swap_amount_sat,
            allow_new_swaps: AtomicBool::new(cfg.allow_new_swaps),
            allowlist: Mutex::new(cfg.allowlisted_peers.iter().cloned().collect()),
            suspicious: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_new_swaps_allowed(&self, allowed: bool) {
        self.allow_new_swaps.store(allowed, Ordering::SeqCst);
    }

    pub fn add_peer(&self, peer_id: &str) {
        self.allowlist
            .lock()
            .expect("policy mutex poisoned")
            .insert(peer_id.to_string());
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.allowlist
            .lock()
            .expect("policy mutex poisoned")
            .remove(peer_id)
    }

    pub fn suspicious_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .suspicious
            .lock()
            .expect("policy mutex poisoned")
            .iter()
            .cloned()
            .collect();
        peers.sort();
        peers
    }
}

impl Policy for ConfigPolicy {
    fn is_peer_allowed(&self, peer_id: &str) -> bool {
        if self
            .suspicious
            .lock()
            .expect("policy mutex poisoned")
            .contains(peer_id)
        {
            return false;
        }
        self.accept_all_peers
            || self
                .allowlist
                .lock()
                .expect("policy mutex poisoned")
                .contains(peer_id)
    }

    fn validate_asset_swap(&self, asset: &Asset) -> Result<()> {
        match asset {
            Asset::Btc => anyhow::ensure!(self.bitcoin_enabled, "bitcoin swaps are disabled"),
            Asset::Liquid(asset_id) => {
                anyhow::ensure!(self.liquid_enabled, "liquid swaps are disabled");
                if let Some(expected) = &self.liquid_asset_id {
                    anyhow::ensure!(
                        expected == asset_id,
                        "unsupported liquid asset {asset_id}"
                    );
                }
            }
        }
        Ok(())
    }

    fn new_swaps_allowed(&self) -> bool {
        self.allow_new_swaps.load(Ordering::SeqCst)
    }

    fn min_swap_amount(&self) -> u64 {
        self.min_swap_amount_sat
    }

    fn add_suspicious_peer(&self, peer_id: &str) {
        let added = self
            .suspicious
            .lock()
            .expect("policy mutex poisoned")
            .insert(peer_id.to_string());
        if added {
            tracing::warn!(peer_id = %peer_id, "peer marked suspicious");
        }
    }
}
