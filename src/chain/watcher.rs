use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChainEvent, ChainEventKind};
use crate::swap::SwapId;

/// Output a swap waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub swap_id: SwapId,
    pub tx_id: String,
    pub vout: u32,
    /// Chain height when the swap started watching. A confirmation below it
    /// belongs to an older transaction and is ignored.
    pub start_height: u32,
    /// Hex encoded scriptPubKey of the output.
    pub script_pubkey: String,
}

/// Backend view used to resolve where an observed output confirmed.
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    /// Height of the block that confirmed the observed output, `None` while
    /// unconfirmed.
    async fn confirmed_height(
        &self,
        observation: &Observation,
        current_height: u32,
    ) -> Result<Option<u32>>;

    async fn raw_transaction(&self, tx_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Confirmation,
    Csv,
}

impl WatchKind {
    fn as_str(self) -> &'static str {
        match self {
            WatchKind::Confirmation => "confirmation",
            WatchKind::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone)]
struct Registration {
    observation: Observation,
    threshold: u32,
}

/// One-shot confirmation and csv registrations, at most one of each per swap.
pub struct TxWatcher {
    events: mpsc::UnboundedSender<ChainEvent>,
    confirmations: Mutex<HashMap<SwapId, Registration>>,
    timeouts: Mutex<HashMap<SwapId, Registration>>,
    tip: AtomicU32,
}

impl TxWatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChainEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            events,
            confirmations: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(HashMap::new()),
            tip: AtomicU32::new(0),
        };
        (watcher, rx)
    }

    /// Fires [`ChainEventKind::Confirmed`] once the output is `depth` blocks
    /// deep. Returns `false` if the swap already has a confirmation watch.
    pub fn add_wait_for_confirmation(&self, observation: Observation, depth: u32) -> bool {
        self.register(WatchKind::Confirmation, observation, depth)
    }

    /// Fires [`ChainEventKind::CsvPassed`] once `csv` blocks were mined on top
    /// of the confirmation. Returns `false` if the swap already has a csv
    /// watch.
    pub fn add_wait_for_csv(&self, observation: Observation, csv: u32) -> bool {
        self.register(WatchKind::Csv, observation, csv)
    }

    /// Drops every registration of `swap_id`.
    pub fn remove(&self, swap_id: &SwapId) {
        self.map(WatchKind::Confirmation)
            .lock()
            .expect("watcher mutex poisoned")
            .remove(swap_id);
        self.map(WatchKind::Csv)
            .lock()
            .expect("watcher mutex poisoned")
            .remove(swap_id);
    }

    pub fn has_confirmation_watch(&self, swap_id: &SwapId) -> bool {
        self.map(WatchKind::Confirmation)
            .lock()
            .expect("watcher mutex poisoned")
            .contains_key(swap_id)
    }

    pub fn has_csv_watch(&self, swap_id: &SwapId) -> bool {
        self.map(WatchKind::Csv)
            .lock()
            .expect("watcher mutex poisoned")
            .contains_key(swap_id)
    }

    /// Highest height seen by [`TxWatcher::process_height`], 0 before the
    /// first block.
    pub fn current_height(&self) -> u32 {
        self.tip.load(Ordering::SeqCst)
    }

    /// Number of live registrations of both kinds.
    pub fn len(&self) -> usize {
        self.snapshot(WatchKind::Confirmation).len() + self.snapshot(WatchKind::Csv).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// scriptPubKeys of every registered output.
    pub fn observed_scripts(&self) -> Vec<String> {
        let mut scripts: Vec<String> = self
            .snapshot(WatchKind::Confirmation)
            .into_iter()
            .chain(self.snapshot(WatchKind::Csv))
            .map(|r| r.observation.script_pubkey)
            .collect();
        scripts.sort();
        scripts.dedup();
        scripts
    }

    /// Checks every registration against `current_height` and fires the ones
    /// that reached their threshold. Returns the number of events sent.
    pub async fn process_height(&self, current_height: u32, source: &dyn ConfirmationSource) -> usize {
        self.tip.fetch_max(current_height, Ordering::SeqCst);
        let mut fired = 0;
        for kind in [WatchKind::Confirmation, WatchKind::Csv] {
            for registration in self.snapshot(kind) {
                if self.check(kind, &registration, current_height, source).await {
                    fired += 1;
                }
            }
        }
        fired
    }

    async fn check(
        &self,
        kind: WatchKind,
        registration: &Registration,
        current_height: u32,
        source: &dyn ConfirmationSource,
    ) -> bool {
        let observation = &registration.observation;
        let confirmed_height = match source.confirmed_height(observation, current_height).await {
            Ok(Some(height)) => height,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(
                    swap_id = %observation.swap_id,
                    tx_id = %observation.tx_id,
                    watch = kind.as_str(),
                    error = %err,
                    "confirmation lookup failed, retrying next block"
                );
                return false;
            }
        };

        if confirmed_height < observation.start_height {
            tracing::debug!(
                swap_id = %observation.swap_id,
                tx_id = %observation.tx_id,
                confirmed_height,
                start_height = observation.start_height,
                "confirmation predates the swap"
            );
            return false;
        }
        if current_height.saturating_sub(confirmed_height) < registration.threshold {
            return false;
        }

        // Only the caller that removes the registration fires it.
        let removed = self
            .map(kind)
            .lock()
            .expect("watcher mutex poisoned")
            .remove(&observation.swap_id)
            .is_some();
        if !removed {
            return false;
        }

        let event_kind = match kind {
            WatchKind::Confirmation => {
                let tx_hex = match source.raw_transaction(&observation.tx_id).await {
                    Ok(tx_hex) => tx_hex,
                    Err(err) => {
                        tracing::debug!(tx_id = %observation.tx_id, error = %err, "raw tx lookup failed");
                        None
                    }
                };
                ChainEventKind::Confirmed { tx_hex }
            }
            WatchKind::Csv => ChainEventKind::CsvPassed,
        };

        tracing::info!(
            swap_id = %observation.swap_id,
            tx_id = %observation.tx_id,
            watch = kind.as_str(),
            confirmed_height,
            current_height,
            "chain watch fired"
        );

        let event = ChainEvent {
            swap_id: observation.swap_id.clone(),
            kind: event_kind,
        };
        if self.events.send(event).is_err() {
            tracing::warn!(swap_id = %observation.swap_id, "chain event receiver dropped");
        }
        true
    }

    fn register(&self, kind: WatchKind, observation: Observation, threshold: u32) -> bool {
        let mut map = self.map(kind).lock().expect("watcher mutex poisoned");
        if map.contains_key(&observation.swap_id) {
            return false;
        }
        tracing::debug!(
            swap_id = %observation.swap_id,
            tx_id = %observation.tx_id,
            watch = kind.as_str(),
            threshold,
            "registered chain watch"
        );
        map.insert(
            observation.swap_id.clone(),
            Registration {
                observation,
                threshold,
            },
        );
        true
    }

    fn snapshot(&self, kind: WatchKind) -> Vec<Registration> {
        self.map(kind)
            .lock()
            .expect("watcher mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn map(&self, kind: WatchKind) -> &Mutex<HashMap<SwapId, Registration>> {
        match kind {
            WatchKind::Confirmation => &self.confirmations,
            WatchKind::Csv => &self.timeouts,
        }
    }
}
