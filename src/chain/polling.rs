//! Watcher backend that polls a node's JSON-RPC interface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::watcher::{ConfirmationSource, Observation, TxWatcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub confirmations: u32,
    pub value_sat: u64,
}

/// Subset of bitcoind/elementsd RPC used by the swap engine.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_block_height(&self) -> Result<u32>;
    /// `None` when the output is unknown or already spent.
    async fn get_tx_out(&self, tx_id: &str, vout: u32) -> Result<Option<TxOut>>;
    async fn get_raw_transaction(&self, tx_id: &str) -> Result<String>;
    /// Returns the txid of the broadcast transaction.
    async fn broadcast_transaction(&self, tx_hex: &str) -> Result<String>;
    async fn ping(&self) -> Result<()>;
    async fn reconnect(&self) -> Result<()>;
}

/// Resolves confirmation heights from `gettxout` confirmation counts.
pub struct RpcConfirmations<'a>(pub &'a dyn ChainRpc);

#[async_trait]
impl ConfirmationSource for RpcConfirmations<'_> {
    async fn confirmed_height(
        &self,
        observation: &Observation,
        current_height: u32,
    ) -> Result<Option<u32>> {
        let tx_out = self
            .0
            .get_tx_out(&observation.tx_id, observation.vout)
            .await
            .with_context(|| format!("gettxout {}:{}", observation.tx_id, observation.vout))?;
        Ok(tx_out
            .filter(|out| out.confirmations > 0)
            .map(|out| (current_height + 1).saturating_sub(out.confirmations)))
    }

    async fn raw_transaction(&self, tx_id: &str) -> Result<Option<String>> {
        Ok(Some(self.0.get_raw_transaction(tx_id).await?))
    }
}

pub struct PollingWatcher {
    rpc: Arc<dyn ChainRpc>,
    watcher: Arc<TxWatcher>,
    interval: Duration,
}

impl PollingWatcher {
    pub fn new(rpc: Arc<dyn ChainRpc>, watcher: Arc<TxWatcher>, interval: Duration) -> Self {
        Self {
            rpc,
            watcher,
            interval,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut disconnected = false;
        loop {
            match self.tick().await {
                Ok(_) if disconnected => {
                    tracing::info!("chain backend reconnected");
                    disconnected = false;
                }
                Ok(_) => {}
                Err(err) => {
                    // Log the first failure of an outage only.
                    if !disconnected {
                        tracing::warn!(error = %err, "chain backend unavailable");
                    }
                    disconnected = true;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("polling watcher stopped");
    }

    /// One round: liveness check, height lookup, registration check.
    pub async fn tick(&self) -> Result<usize> {
        if let Err(err) = self.rpc.ping().await {
            tracing::debug!(error = %err, "chain backend ping failed, reconnecting");
            self.rpc.reconnect().await.context("reconnect chain backend")?;
            self.rpc.ping().await.context("ping chain backend")?;
        }

        let height = self
            .rpc
            .get_block_height()
            .await
            .context("get block height")?;
        Ok(self
            .watcher
            .process_height(height, &RpcConfirmations(self.rpc.as_ref()))
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::watcher::tests::observation;
    use crate::chain::ChainEventKind;
    use crate::swap::SwapId;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRpc {
        height: AtomicU32,
        confirmations: AtomicU32,
        down: Mutex<bool>,
        reconnects: AtomicUsize,
    }

    #[async_trait]
    impl ChainRpc for FakeRpc {
        async fn get_block_height(&self) -> Result<u32> {
            Ok(self.height.load(Ordering::SeqCst))
        }

        async fn get_tx_out(&self, _: &str, _: u32) -> Result<Option<TxOut>> {
            let confirmations = self.confirmations.load(Ordering::SeqCst);
            Ok(Some(TxOut {
                confirmations,
                value_sat: 10_000,
            }))
        }

        async fn get_raw_transaction(&self, _: &str) -> Result<String> {
            Ok("0200".to_string())
        }

        async fn broadcast_transaction(&self, _: &str) -> Result<String> {
            anyhow::bail!("not used")
        }

        async fn ping(&self) -> Result<()> {
            if *self.down.lock().unwrap() {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }

        async fn reconnect(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            *self.down.lock().unwrap() = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn confirmation_count_maps_to_depth() {
        let rpc = Arc::new(FakeRpc::default());
        let (watcher, mut rx) = TxWatcher::new();
        let watcher = Arc::new(watcher);
        let polling = PollingWatcher::new(rpc.clone(), watcher.clone(), Duration::from_secs(1));

        watcher.add_wait_for_confirmation(observation(SwapId::random()), 3);
        rpc.height.store(110, Ordering::SeqCst);

        // Three confirmations: mined at 108, only two blocks on top.
        rpc.confirmations.store(3, Ordering::SeqCst);
        assert_eq!(polling.tick().await.unwrap(), 0);

        rpc.confirmations.store(4, Ordering::SeqCst);
        assert_eq!(polling.tick().await.unwrap(), 1);
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            ChainEventKind::Confirmed { .. }
        ));
    }

    #[tokio::test]
    async fn reconnects_before_checking() {
        let rpc = Arc::new(FakeRpc::default());
        *rpc.down.lock().unwrap() = true;
        let (watcher, _rx) = TxWatcher::new();
        let polling = PollingWatcher::new(rpc.clone(), Arc::new(watcher), Duration::from_secs(1));

        polling.tick().await.unwrap();
        assert_eq!(rpc.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let rpc = Arc::new(FakeRpc::default());
        let (watcher, _rx) = TxWatcher::new();
        let polling = PollingWatcher::new(rpc, Arc::new(watcher), Duration::from_secs(10));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = polling.spawn(stop_rx);
        tokio::time::sleep(Duration::from_secs(30)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
