//! Watcher backend driven by an Electrum header subscription.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash, sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::watcher::{ConfirmationSource, Observation, TxWatcher};

/// Entry of `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub tx_hash: String,
    /// Zero or negative while in the mempool.
    pub height: i64,
}

#[async_trait]
pub trait ElectrumApi: Send + Sync {
    async fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryEntry>>;
    async fn get_transaction(&self, tx_id: &str) -> Result<String>;
    async fn ping(&self) -> Result<()>;
    async fn reconnect(&self) -> Result<()>;
    /// Opens a `blockchain.headers.subscribe` stream. Its first item is the
    /// current tip.
    async fn subscribe_headers(&self) -> Result<Box<dyn HeaderSubscription>>;
}

/// Stream of new chain tips.
#[async_trait]
pub trait HeaderSubscription: Send {
    /// Height of the next header; `None` once the subscription closed.
    async fn next_header(&mut self) -> Result<Option<u32>>;
}

/// Electrum script hash: sha256 of the script with its bytes reversed, hex
/// encoded.
pub fn script_hash(script_pubkey: &[u8]) -> String {
    let mut hash = sha256::Hash::hash(script_pubkey).to_byte_array();
    hash.reverse();
    hex::encode(hash)
}

pub struct ElectrumConfirmations<'a>(pub &'a dyn ElectrumApi);

#[async_trait]
impl ConfirmationSource for ElectrumConfirmations<'_> {
    async fn confirmed_height(&self, observation: &Observation, _: u32) -> Result<Option<u32>> {
        let script = hex::decode(&observation.script_pubkey)
            .with_context(|| format!("decode script_pubkey of {}", observation.swap_id))?;
        let history = self
            .0
            .get_history(&script_hash(&script))
            .await
            .context("get script history")?;

        Ok(history
            .iter()
            .find(|entry| entry.tx_hash == observation.tx_id)
            .filter(|entry| entry.height > 0)
            .and_then(|entry| u32::try_from(entry.height).ok()))
    }

    async fn raw_transaction(&self, tx_id: &str) -> Result<Option<String>> {
        Ok(Some(self.0.get_transaction(tx_id).await?))
    }
}

/// A quiet subscription is replaced after this long, since a stalled
/// connection may never report an error.
pub const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

pub struct ElectrumWatcher {
    api: Arc<dyn ElectrumApi>,
    watcher: Arc<TxWatcher>,
}

impl ElectrumWatcher {
    pub fn new(api: Arc<dyn ElectrumApi>, watcher: Arc<TxWatcher>) -> Self {
        Self { api, watcher }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Checks the registrations on every new header until `shutdown` flips
    /// to `true` or its sender is dropped. A failed or closed subscription is
    /// reopened with a capped exponential backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut headers: Option<Box<dyn HeaderSubscription>> = None;
        let mut delay = RETRY_MIN;
        let mut refresh =
            tokio::time::interval_at(Instant::now() + RESUBSCRIBE_INTERVAL, RESUBSCRIBE_INTERVAL);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            if headers.is_none() {
                match self.api.subscribe_headers().await {
                    Ok(subscription) => {
                        refresh.reset();
                        headers = Some(subscription);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, retry_in = ?delay, "electrum subscribe failed");
                        if wait_or_stop(delay, &mut shutdown).await {
                            break;
                        }
                        delay = (delay * 2).min(RETRY_MAX);
                        continue;
                    }
                }
            }
            let Some(subscription) = headers.as_mut() else {
                continue;
            };

            let next = tokio::select! {
                next = subscription.next_header() => Some(next),
                _ = refresh.tick() => None,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let lost = match next {
                None => {
                    tracing::debug!("refreshing electrum header subscription");
                    headers = None;
                    continue;
                }
                Some(Ok(Some(height))) => {
                    delay = RETRY_MIN;
                    if let Err(err) = self.on_header(height).await {
                        tracing::warn!(height, error = %err, "electrum header processing failed");
                    }
                    continue;
                }
                Some(Ok(None)) => anyhow::anyhow!("subscription closed"),
                Some(Err(err)) => err,
            };

            tracing::warn!(error = %lost, retry_in = ?delay, "electrum header subscription lost");
            headers = None;
            if let Err(err) = self.api.reconnect().await {
                tracing::warn!(error = %err, "electrum reconnect failed");
            }
            if wait_or_stop(delay, &mut shutdown).await {
                break;
            }
            delay = (delay * 2).min(RETRY_MAX);
        }
        tracing::debug!("electrum watcher stopped");
    }

    pub async fn on_header(&self, height: u32) -> Result<usize> {
        if let Err(err) = self.api.ping().await {
            tracing::debug!(error = %err, "electrum ping failed, reconnecting");
            self.api.reconnect().await.context("reconnect electrum")?;
        }
        Ok(self
            .watcher
            .process_height(height, &ElectrumConfirmations(self.api.as_ref()))
            .await)
    }
}

/// Sleeps for `delay`. Returns `true` when shutdown was requested meanwhile.
async fn wait_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
