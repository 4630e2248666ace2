use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::effects::{Broadcast, Effect, InvoicePurpose, OpeningTx, SwapEvent, Watch};
use super::fsm;
use super::store::SwapStore;
use super::{Asset, SwapId, SwapRecord, SwapType};
use crate::chain::{ChainEvent, ChainEventKind, Observation, TxWatcher};
use crate::config::Config;
use crate::messages::{self, PROTOCOL_VERSION, PeerMessage};
use crate::messenger::{Messenger, MessengerError, RedundantSender, SenderManager};
use crate::poll::PollService;

/// Lightning node operations the swap engine needs.
#[async_trait]
pub trait LightningClient: Send + Sync {
    /// Returns a bolt11 invoice.
    async fn create_invoice(
        &self,
        swap_id: &SwapId,
        purpose: InvoicePurpose,
        amount_msat: u64,
    ) -> Result<String>;

    /// Pays `invoice` and returns the hex preimage.
    async fn pay_invoice(
        &self,
        swap_id: &SwapId,
        purpose: InvoicePurpose,
        invoice: &str,
    ) -> Result<String>;
}

/// On-chain wallet of one chain. Builds and signs every swap transaction.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn get_address(&self) -> Result<String>;
    /// Spendable balance in sat.
    async fn get_balance(&self) -> Result<u64>;
    async fn send_to_address(&self, address: &str, amount_sat: u64) -> Result<String>;
    /// Hex hash160 of the key this node uses in the swap script.
    async fn pubkey_hash(&self, swap_id: &SwapId) -> Result<String>;
    /// Fee in sat the maker charges upfront for broadcasting the opening tx.
    async fn swap_out_fee(&self, record: &SwapRecord) -> Result<u64>;
    /// Must return the same transaction when called again for the same swap.
    async fn create_and_broadcast_opening(&self, record: &SwapRecord) -> Result<OpeningTx>;
    /// Whether `tx_hex` pays the swap amount to the script the taker expects
    /// at `record.opening_tx_vout`, locked with `record.csv`.
    async fn validate_opening_tx(&self, record: &SwapRecord, tx_hex: &str) -> Result<bool>;
    /// Spends the opening output along the `claim` path; returns the txid.
    async fn create_claim_transaction(&self, record: &SwapRecord, claim: Broadcast)
    -> Result<String>;
}

/// Admission rules for swaps and peers.
pub trait Policy: Send + Sync {
    fn is_peer_allowed(&self, peer_id: &str) -> bool;
    fn validate_asset_swap(&self, asset: &Asset) -> Result<()>;
    fn new_swaps_allowed(&self) -> bool;
    fn min_swap_amount(&self) -> u64;
    /// Records a peer that let a swap run into the csv timeout.
    fn add_suspicious_peer(&self, peer_id: &str);
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("swap rejected: {0}")]
    PolicyRejected(String),
    #[error("swap {0} not found")]
    SwapNotFound(SwapId),
    #[error("new swaps are disabled")]
    NewSwapsDisabled,
    #[error("swap {0} already exists")]
    SwapExists(SwapId),
    #[error("message for swap {swap_id} from unexpected peer {peer_id}")]
    WrongPeer { swap_id: SwapId, peer_id: String },
}

#[derive(Clone, Default)]
pub struct Wallets {
    pub bitcoin: Option<Arc<dyn Wallet>>,
    pub liquid: Option<Arc<dyn Wallet>>,
}

impl Wallets {
    fn get(&self, asset: &Asset) -> Result<Arc<dyn Wallet>> {
        let wallet = match asset {
            Asset::Btc => self.bitcoin.clone(),
            Asset::Liquid(_) => self.liquid.clone(),
        };
        wallet.with_context(|| format!("no wallet configured for {asset}"))
    }
}

pub struct ServiceDeps {
    pub messenger: Arc<dyn Messenger>,
    pub lightning: Arc<dyn LightningClient>,
    pub wallets: Wallets,
    pub policy: Arc<dyn Policy>,
    pub store: Arc<dyn SwapStore>,
    pub watcher: Arc<TxWatcher>,
}

type SwapHandle = Arc<tokio::sync::Mutex<SwapRecord>>;

/// Owns the live swaps and feeds them events, one at a time per swap.
#[derive(Clone)]
pub struct SwapService {
    config: Arc<Config>,
    local_node_id: Arc<str>,
    messenger: Arc<dyn Messenger>,
    lightning: Arc<dyn LightningClient>,
    wallets: Wallets,
    policy: Arc<dyn Policy>,
    store: Arc<dyn SwapStore>,
    watcher: Arc<TxWatcher>,
    senders: Arc<SenderManager>,
    poll: Arc<PollService>,
    swaps: Arc<Mutex<HashMap<SwapId, SwapHandle>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SwapService {
    pub fn new(config: Config, local_node_id: impl Into<String>, deps: ServiceDeps) -> Self {
        let poll = PollService::new(
            deps.messenger.clone(),
            deps.policy.clone(),
            config.supported_assets(),
        );
        let (shutdown, _) = watch::channel(false);
        let local_node_id: String = local_node_id.into();
        Self {
            config: Arc::new(config),
            local_node_id: Arc::from(local_node_id),
            messenger: deps.messenger,
            lightning: deps.lightning,
            wallets: deps.wallets,
            policy: deps.policy,
            store: deps.store,
            watcher: deps.watcher,
            senders: Arc::new(SenderManager::new()),
            poll: Arc::new(poll),
            swaps: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn senders(&self) -> &SenderManager {
        &self.senders
    }

    pub fn poll(&self) -> &Arc<PollService> {
        &self.poll
    }

    /// Swap-out: pay a fee invoice and the swap invoice over Lightning,
    /// receive the amount on-chain.
    pub async fn start_swap_out(
        &self,
        peer_id: &str,
        asset: Asset,
        channel_id: &str,
        amount: u64,
    ) -> Result<SwapRecord> {
        self.check_new_swap(&asset, amount)?;
        let wallet = self.wallets.get(&asset)?;

        let mut record = SwapRecord::new_sender(
            SwapType::SwapOut,
            &self.local_node_id,
            peer_id,
            asset,
            channel_id,
            amount,
        );
        record.taker_pubkey_hash = Some(
            wallet
                .pubkey_hash(&record.id)
                .await
                .context("get taker pubkey hash")?,
        );
        self.expect_opening(&mut record);

        self.start(record).await
    }

    /// Swap-in: lock the amount on-chain, get paid over Lightning.
    pub async fn start_swap_in(
        &self,
        peer_id: &str,
        asset: Asset,
        channel_id: &str,
        amount: u64,
    ) -> Result<SwapRecord> {
        self.check_new_swap(&asset, amount)?;
        let wallet = self.wallets.get(&asset)?;

        let balance = wallet.get_balance().await.context("get wallet balance")?;
        if balance < amount {
            return Err(ServiceError::PolicyRejected(format!(
                "insufficient wallet balance: {balance} < {amount}"
            ))
            .into());
        }

        let mut record = SwapRecord::new_sender(
            SwapType::SwapIn,
            &self.local_node_id,
            peer_id,
            asset,
            channel_id,
            amount,
        );
        record.maker_pubkey_hash = Some(
            wallet
                .pubkey_hash(&record.id)
                .await
                .context("get maker pubkey hash")?,
        );

        self.start(record).await
    }

    async fn start(&self, record: SwapRecord) -> Result<SwapRecord> {
        let swap_id = record.id.clone();
        tracing::info!(
            swap_id = %swap_id,
            swap_type = %record.swap_type,
            peer_id = %record.peer_node_id,
            asset = %record.asset,
            amount = record.amount,
            "starting swap"
        );

        let handle = self.insert(record)?;
        let result = self
            .dispatch(&swap_id, handle, None, Vec::new(), Some(SwapEvent::Start))
            .await;
        if result.is_err() {
            self.forget(&swap_id);
        }
        result
    }

    pub fn get_swap(&self, swap_id: &SwapId) -> Result<SwapRecord> {
        self.store
            .get(swap_id)?
            .ok_or_else(|| ServiceError::SwapNotFound(swap_id.clone()).into())
    }

    pub fn list_swaps(&self) -> Result<Vec<SwapRecord>> {
        self.store.list()
    }

    pub fn list_active_swaps(&self) -> Result<Vec<SwapRecord>> {
        self.store.list_active()
    }

    pub fn has_active_swaps(&self) -> Result<bool> {
        Ok(!self.store.list_active()?.is_empty())
    }

    /// Local cancel. Fails once the swap passed its irreversible step.
    pub async fn cancel_swap(&self, swap_id: &SwapId, reason: &str) -> Result<SwapRecord> {
        let handle = self
            .handle(swap_id)
            .ok_or_else(|| ServiceError::SwapNotFound(swap_id.clone()))?;
        self.dispatch(
            swap_id,
            handle,
            None,
            Vec::new(),
            Some(SwapEvent::Cancel {
                reason: reason.to_string(),
            }),
        )
        .await
    }

    /// Entry point for custom messages delivered by the host node.
    pub async fn on_message_received(
        &self,
        peer_id: &str,
        message_type: u16,
        payload: &[u8],
    ) -> Result<()> {
        let message = messages::decode(message_type, payload)
            .with_context(|| format!("decode message type {message_type} from {peer_id}"))?;
        tracing::debug!(
            peer_id = %peer_id,
            kind = ?message.message_type(),
            "received peer message"
        );

        match message {
            PeerMessage::Poll(_) | PeerMessage::RequestPoll(_) => {
                self.poll.handle_message(peer_id, &message).await
            }
            PeerMessage::SwapInRequest(_) | PeerMessage::SwapOutRequest(_) => {
                self.on_swap_request(peer_id, message).await
            }
            _ => {
                let swap_id = message
                    .swap_id()
                    .cloned()
                    .context("swap message without swap id")?;
                let Some(handle) = self.handle(&swap_id) else {
                    if self.store.get(&swap_id)?.is_some() {
                        tracing::debug!(swap_id = %swap_id, "message for finished swap ignored");
                        return Ok(());
                    }
                    return Err(ServiceError::SwapNotFound(swap_id).into());
                };
                self.dispatch(
                    &swap_id,
                    handle,
                    Some(peer_id),
                    Vec::new(),
                    Some(SwapEvent::Message(message)),
                )
                .await
                .map(|_| ())
            }
        }
    }

    /// Handles an inbound message on its own task.
    pub fn spawn_message(&self, peer_id: String, message_type: u16, payload: Vec<u8>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(err) = service
                .on_message_received(&peer_id, message_type, &payload)
                .await
            {
                tracing::warn!(peer_id = %peer_id, message_type, error = %err, "peer message rejected");
            }
        })
    }

    async fn on_swap_request(&self, peer_id: &str, message: PeerMessage) -> Result<()> {
        let (swap_id, swap_type, asset, channel_id, amount, version) = match &message {
            PeerMessage::SwapInRequest(m) => (
                m.swap_id.clone(),
                SwapType::SwapIn,
                m.asset.clone(),
                m.channel_id.clone(),
                m.amount,
                m.protocol_version,
            ),
            PeerMessage::SwapOutRequest(m) => (
                m.swap_id.clone(),
                SwapType::SwapOut,
                m.asset.clone(),
                m.channel_id.clone(),
                m.amount,
                m.protocol_version,
            ),
            _ => anyhow::bail!("not a swap request: {:?}", message.message_type()),
        };

        if let Some(handle) = self.handle(&swap_id) {
            return self
                .dispatch(&swap_id, handle, Some(peer_id), Vec::new(), Some(SwapEvent::Message(message)))
                .await
                .map(|_| ());
        }
        if self.store.get(&swap_id)?.is_some() {
            tracing::debug!(swap_id = %swap_id, "request for finished swap ignored");
            return Ok(());
        }

        if let Err(reason) = self
            .check_request(peer_id, swap_type, &asset, amount, version)
            .await
        {
            tracing::info!(
                swap_id = %swap_id,
                peer_id = %peer_id,
                reason = %reason,
                "rejecting swap request"
            );
            let reply = PeerMessage::Canceled(messages::Canceled {
                swap_id,
                message: reason.clone(),
            });
            self.send_once(peer_id, &reply).await;
            return Err(ServiceError::PolicyRejected(reason).into());
        }

        let wallet = self.wallets.get(&asset)?;
        let mut record =
            SwapRecord::new_receiver(swap_id.clone(), swap_type, peer_id, asset, &channel_id, amount);
        let pubkey_hash = wallet
            .pubkey_hash(&swap_id)
            .await
            .context("get pubkey hash")?;
        match swap_type {
            SwapType::SwapIn => {
                record.taker_pubkey_hash = Some(pubkey_hash);
                self.expect_opening(&mut record);
            }
            SwapType::SwapOut => record.maker_pubkey_hash = Some(pubkey_hash),
        }

        tracing::info!(
            swap_id = %swap_id,
            swap_type = %swap_type,
            peer_id = %peer_id,
            amount,
            "accepted swap request"
        );

        // A concurrent duplicate may have inserted the swap meanwhile.
        let (handle, inserted) = match self.insert(record) {
            Ok(handle) => (handle, true),
            Err(_) => (
                self.handle(&swap_id)
                    .ok_or_else(|| ServiceError::SwapNotFound(swap_id.clone()))?,
                false,
            ),
        };
        let result = self
            .dispatch(
                &swap_id,
                handle,
                Some(peer_id),
                Vec::new(),
                Some(SwapEvent::Message(message)),
            )
            .await;
        if result.is_err() && inserted {
            self.forget(&swap_id);
        }
        result.map(|_| ())
    }

    /// Terms a taker holds the maker's opening transaction to.
    fn expect_opening(&self, record: &mut SwapRecord) {
        record.csv = Some(self.config.chain_params(&record.asset).csv);
        record.start_height = Some(self.watcher.current_height());
    }

    async fn check_request(
        &self,
        peer_id: &str,
        swap_type: SwapType,
        asset: &Asset,
        amount: u64,
        version: u64,
    ) -> Result<(), String> {
        if version != PROTOCOL_VERSION {
            return Err(format!(
                "incompatible protocol version {version}, expected {PROTOCOL_VERSION}"
            ));
        }
        if !self.policy.is_peer_allowed(peer_id) {
            return Err("peer not allowed".to_string());
        }
        self.check_new_swap(asset, amount).map_err(|err| match err {
            ServiceError::PolicyRejected(reason) => reason,
            other => other.to_string(),
        })?;

        // The swap-out receiver funds the opening transaction.
        if swap_type == SwapType::SwapOut {
            let wallet = self.wallets.get(asset).map_err(|err| err.to_string())?;
            let balance = wallet
                .get_balance()
                .await
                .map_err(|err| format!("wallet unavailable: {err}"))?;
            if balance < amount {
                return Err("insufficient on-chain balance".to_string());
            }
        }
        Ok(())
    }

    fn check_new_swap(&self, asset: &Asset, amount: u64) -> Result<(), ServiceError> {
        if !self.policy.new_swaps_allowed() {
            return Err(ServiceError::NewSwapsDisabled);
        }
        self.policy
            .validate_asset_swap(asset)
            .map_err(|err| ServiceError::PolicyRejected(err.to_string()))?;
        let min = self.policy.min_swap_amount();
        if amount < min {
            return Err(ServiceError::PolicyRejected(format!(
                "amount {amount} below minimum {min}"
            )));
        }
        if self.wallets.get(asset).is_err() {
            return Err(ServiceError::PolicyRejected(format!("asset {asset} not supported")));
        }
        Ok(())
    }

    pub async fn on_chain_event(&self, event: ChainEvent) -> Result<()> {
        let Some(handle) = self.handle(&event.swap_id) else {
            tracing::debug!(swap_id = %event.swap_id, "chain event for inactive swap ignored");
            return Ok(());
        };
        let swap_event = match event.kind {
            ChainEventKind::Confirmed { tx_hex } => SwapEvent::TxConfirmed { tx_hex },
            ChainEventKind::CsvPassed => SwapEvent::CsvPassed,
        };
        self.dispatch(&event.swap_id, handle, None, Vec::new(), Some(swap_event))
            .await
            .map(|_| ())
    }

    /// Forwards watcher events, each on its own task, until shutdown.
    pub fn spawn_chain_events(&self, mut events: mpsc::UnboundedReceiver<ChainEvent>) -> JoinHandle<()> {
        let service = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };
                let service = service.clone();
                tokio::spawn(async move {
                    let swap_id = event.swap_id.clone();
                    if let Err(err) = service.on_chain_event(event).await {
                        tracing::warn!(swap_id = %swap_id, error = %err, "chain event failed");
                    }
                });
            }
        })
    }

    /// Lightning notification that an invoice this node issued was paid.
    pub async fn on_invoice_paid(&self, swap_id: &SwapId, purpose: InvoicePurpose) -> Result<()> {
        let Some(handle) = self.handle(swap_id) else {
            tracing::debug!(swap_id = %swap_id, "payment for inactive swap ignored");
            return Ok(());
        };
        self.dispatch(
            swap_id,
            handle,
            None,
            Vec::new(),
            Some(SwapEvent::InvoiceSettled { purpose }),
        )
        .await
        .map(|_| ())
    }

    /// Reloads every active swap and re-arms what its state waits on.
    /// Swaps already live in memory are skipped. Returns how many swaps were
    /// resumed.
    pub async fn recover_swaps(&self) -> Result<usize> {
        let records = self.store.list_active().context("load active swaps")?;
        let mut recovered = 0;

        for record in records {
            let swap_id = record.id.clone();
            let plan = fsm::resume_plan(&record);
            let state = record.current;

            let handle = {
                let mut swaps = self.swaps.lock().expect("swaps mutex poisoned");
                if swaps.contains_key(&swap_id) {
                    continue;
                }
                let handle = Arc::new(tokio::sync::Mutex::new(record));
                swaps.insert(swap_id.clone(), handle.clone());
                handle
            };

            recovered += 1;
            tracing::info!(swap_id = %swap_id, state = %state, "recovering swap");
            if let Err(err) = self
                .dispatch(&swap_id, handle, None, plan.effects, plan.event)
                .await
            {
                tracing::warn!(swap_id = %swap_id, error = %err, "swap recovery failed");
            }
        }

        Ok(recovered)
    }

    /// Receiver flipped by [`SwapService::shutdown`], for backend loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stops retries and background loops. Persisted swaps are untouched and
    /// resume through [`SwapService::recover_swaps`].
    pub fn shutdown(&self) {
        tracing::info!("shutting down swap service");
        self.shutdown.send_replace(true);
        self.senders.stop_all();
    }

    fn handle(&self, swap_id: &SwapId) -> Option<SwapHandle> {
        self.swaps
            .lock()
            .expect("swaps mutex poisoned")
            .get(swap_id)
            .cloned()
    }

    /// Drops a swap that never got its first transition committed.
    fn forget(&self, swap_id: &SwapId) {
        self.swaps
            .lock()
            .expect("swaps mutex poisoned")
            .remove(swap_id);
        self.senders.remove_sender(&swap_id.to_string());
        self.watcher.remove(swap_id);
    }

    fn insert(&self, record: SwapRecord) -> Result<SwapHandle, ServiceError> {
        let mut swaps = self.swaps.lock().expect("swaps mutex poisoned");
        if swaps.contains_key(&record.id) {
            return Err(ServiceError::SwapExists(record.id));
        }
        let swap_id = record.id.clone();
        let handle = Arc::new(tokio::sync::Mutex::new(record));
        swaps.insert(swap_id, handle.clone());
        Ok(handle)
    }

    /// Runs `effects`, then `event` and every follow-up event under the
    /// swap's lock. Only a rejected `event` is returned as an error;
    /// rejected follow-ups are logged.
    async fn dispatch(
        &self,
        swap_id: &SwapId,
        handle: SwapHandle,
        from_peer: Option<&str>,
        effects: Vec<Effect>,
        event: Option<SwapEvent>,
    ) -> Result<SwapRecord> {
        let mut record = handle.lock().await;

        if let Some(peer_id) = from_peer
            && peer_id != record.peer_node_id
        {
            return Err(ServiceError::WrongPeer {
                swap_id: swap_id.clone(),
                peer_id: peer_id.to_string(),
            }
            .into());
        }

        let mut queue: VecDeque<(SwapEvent, bool)> = self
            .execute(&record, &effects)
            .await?
            .into_iter()
            .map(|e| (e, false))
            .collect();
        if let Some(event) = event {
            queue.push_front((event, true));
        }

        while let Some((event, strict)) = queue.pop_front() {
            let transition = match fsm::transition(&record, &event) {
                Ok(Some(transition)) => transition,
                Ok(None) => {
                    tracing::debug!(
                        swap_id = %swap_id,
                        state = %record.current,
                        event = event.name(),
                        "ignoring already processed event"
                    );
                    continue;
                }
                Err(err) => {
                    if matches!(event, SwapEvent::Message(_)) {
                        tracing::warn!(swap_id = %swap_id, error = %err, "protocol violation");
                    } else {
                        tracing::warn!(swap_id = %swap_id, error = %err, "event rejected");
                    }
                    if strict {
                        return Err(err.into());
                    }
                    continue;
                }
            };

            tracing::info!(
                swap_id = %swap_id,
                from = %record.current,
                to = %transition.next(),
                event = event.name(),
                "swap transition"
            );

            let follow_ups = self.execute(&transition.record, &transition.effects).await?;
            *record = transition.record;
            queue.extend(follow_ups.into_iter().map(|e| (e, false)));
        }

        let snapshot = record.clone();
        drop(record);

        if snapshot.current.is_terminal() {
            tracing::info!(swap_id = %swap_id, state = %snapshot.current, "swap finished");
            self.swaps
                .lock()
                .expect("swaps mutex poisoned")
                .remove(swap_id);
        }
        Ok(snapshot)
    }

    /// Executes effects in order and returns the events they produced.
    /// Only a failed `Persist` is an error: the transition is then not
    /// committed in memory.
    async fn execute(&self, record: &SwapRecord, effects: &[Effect]) -> Result<Vec<SwapEvent>> {
        let mut follow_ups = Vec::new();
        let sender_id = record.id.to_string();

        for effect in effects {
            match effect {
                Effect::Send { message, retry } => self.send(record, message, *retry).await,
                Effect::StopRetry => {
                    self.senders.remove_sender(&sender_id);
                }
                Effect::WatchConfirmation(w) => {
                    let depth = self.config.chain_params(&record.asset).confirmations;
                    self.watcher
                        .add_wait_for_confirmation(observation(record, w), depth);
                }
                Effect::WatchTimeout(w) => {
                    let csv = record
                        .csv
                        .unwrap_or(self.config.chain_params(&record.asset).csv);
                    self.watcher.add_wait_for_csv(observation(record, w), csv);
                }
                Effect::Unwatch => self.watcher.remove(&record.id),
                Effect::RequestBroadcast(kind) => follow_ups.push(self.broadcast(record, *kind).await),
                Effect::ValidateOpening { tx_hex } => {
                    follow_ups.push(self.validate_opening(record, tx_hex).await)
                }
                Effect::PayInvoice { purpose, invoice } => {
                    let event = match self.lightning.pay_invoice(&record.id, *purpose, invoice).await {
                        Ok(preimage) => SwapEvent::InvoicePaid {
                            purpose: *purpose,
                            preimage,
                        },
                        Err(err) => action_failed(record, "pay invoice", &err),
                    };
                    follow_ups.push(event);
                }
                Effect::CreateInvoice { purpose } => {
                    follow_ups.push(self.create_invoice(record, *purpose).await)
                }
                Effect::ReportSuspiciousPeer => self.policy.add_suspicious_peer(&record.peer_node_id),
                Effect::Cancel { reason } => {
                    self.senders.remove_sender(&sender_id);
                    self.watcher.remove(&record.id);
                    tracing::info!(swap_id = %record.id, reason = %reason, "swap canceled");
                }
                Effect::Persist => self
                    .store
                    .put(record)
                    .with_context(|| format!("persist swap {}", record.id))?,
            }
        }

        Ok(follow_ups)
    }

    async fn send(&self, record: &SwapRecord, message: &PeerMessage, retry: bool) {
        let (kind, payload) = match messages::encode(message) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(swap_id = %record.id, error = %err, "encode peer message");
                return;
            }
        };

        if !retry {
            if let Err(err) = self
                .messenger
                .send_message(&record.peer_node_id, payload, kind.code())
                .await
            {
                tracing::warn!(
                    swap_id = %record.id,
                    kind = ?kind,
                    error = %err,
                    "send peer message failed"
                );
            }
            return;
        }

        let sender = RedundantSender::new(
            self.messenger.clone(),
            record.peer_node_id.clone(),
            payload,
            kind.code(),
            self.config.retry_interval(),
        );
        if let Err(MessengerError::AlreadyHasSender(id)) =
            self.senders.add_sender(&record.id.to_string(), sender)
        {
            tracing::debug!(swap_id = %id, kind = ?kind, "retry sender already running");
        }
    }

    async fn send_once(&self, peer_id: &str, message: &PeerMessage) {
        match messages::encode(message) {
            Ok((kind, payload)) => {
                if let Err(err) = self.messenger.send_message(peer_id, payload, kind.code()).await {
                    tracing::warn!(peer_id = %peer_id, error = %err, "send peer message failed");
                }
            }
            Err(err) => tracing::warn!(peer_id = %peer_id, error = %err, "encode peer message"),
        }
    }

    async fn broadcast(&self, record: &SwapRecord, kind: Broadcast) -> SwapEvent {
        let wallet = match self.wallets.get(&record.asset) {
            Ok(wallet) => wallet,
            Err(err) => return action_failed(record, "broadcast", &err),
        };

        match kind {
            Broadcast::Opening => match wallet.create_and_broadcast_opening(record).await {
                Ok(tx) => {
                    tracing::info!(swap_id = %record.id, tx_id = %tx.tx_id, "opening tx broadcast");
                    SwapEvent::OpeningBroadcasted(tx)
                }
                Err(err) => action_failed(record, "broadcast opening tx", &err),
            },
            claim => match wallet.create_claim_transaction(record, claim).await {
                Ok(tx_id) => {
                    tracing::info!(swap_id = %record.id, tx_id = %tx_id, claim = ?claim, "claim tx broadcast");
                    SwapEvent::ClaimBroadcasted { tx_id }
                }
                Err(err) => action_failed(record, "broadcast claim tx", &err),
            },
        }
    }

    async fn validate_opening(&self, record: &SwapRecord, tx_hex: &str) -> SwapEvent {
        let valid = match self.wallets.get(&record.asset) {
            Ok(wallet) => wallet.validate_opening_tx(record, tx_hex).await,
            Err(err) => Err(err),
        };
        match valid {
            Ok(true) => SwapEvent::OpeningValidated,
            Ok(false) => action_failed(
                record,
                "validate opening tx",
                &anyhow::anyhow!("output does not match the swap terms"),
            ),
            Err(err) => action_failed(record, "validate opening tx", &err),
        }
    }

    async fn create_invoice(&self, record: &SwapRecord, purpose: InvoicePurpose) -> SwapEvent {
        let amount_msat = match purpose {
            InvoicePurpose::Claim => record.amount_msat(),
            InvoicePurpose::Fee => {
                let fee = match self.wallets.get(&record.asset) {
                    Ok(wallet) => wallet.swap_out_fee(record).await,
                    Err(err) => Err(err),
                };
                match fee {
                    Ok(fee_sat) => fee_sat.saturating_mul(1000),
                    Err(err) => return action_failed(record, "estimate swap fee", &err),
                }
            }
        };

        match self
            .lightning
            .create_invoice(&record.id, purpose, amount_msat)
            .await
        {
            Ok(invoice) => SwapEvent::InvoiceCreated { purpose, invoice },
            Err(err) => action_failed(record, "create invoice", &err),
        }
    }
}

fn observation(record: &SwapRecord, watch: &Watch) -> Observation {
    Observation {
        swap_id: record.id.clone(),
        tx_id: watch.tx_id.clone(),
        vout: watch.vout,
        start_height: watch.start_height,
        script_pubkey: watch.script_pubkey.clone(),
    }
}

fn action_failed(record: &SwapRecord, action: &str, err: &anyhow::Error) -> SwapEvent {
    tracing::warn!(swap_id = %record.id, action, error = %err, "swap action failed");
    SwapEvent::ActionFailed {
        reason: format!("{action}: {err:#}"),
    }
}
