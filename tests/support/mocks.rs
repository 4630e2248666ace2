use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use ln_chain_swap::chain::{ChainEvent, ConfirmationSource, Observation, TxWatcher};
use ln_chain_swap::config::{Config, ConfigPolicy};
use ln_chain_swap::messages::{self, MessageType, PeerMessage};
use ln_chain_swap::messenger::Messenger;
use ln_chain_swap::swap::{SwapId, SwapRecord};
use ln_chain_swap::swap::effects::{Broadcast, InvoicePurpose, OpeningTx};
use ln_chain_swap::swap::service::{LightningClient, ServiceDeps, SwapService, Wallet, Wallets};
use ln_chain_swap::swap::store::{MemorySwapStore, SwapStore};

/// Records every outgoing message and, once connected, delivers it to the
/// remote service on its own task.
pub struct PeerLink {
    local_id: String,
    remote: OnceLock<SwapService>,
    sent: Mutex<Vec<(String, PeerMessage)>>,
}

impl PeerLink {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            remote: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn connect(&self, remote: SwapService) {
        let _ = self.remote.set(remote);
    }

    pub fn sent(&self) -> Vec<(String, PeerMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, kind: MessageType) -> Vec<PeerMessage> {
        self.sent()
            .into_iter()
            .filter(|(_, m)| m.message_type() == kind)
            .map(|(_, m)| m)
            .collect()
    }
}

#[async_trait]
impl Messenger for PeerLink {
    async fn send_message(&self, peer_id: &str, payload: Vec<u8>, message_type: u16) -> Result<()> {
        let message = messages::decode(message_type, &payload)?;
        self.sent
            .lock()
            .unwrap()
            .push((peer_id.to_string(), message));
        if let Some(remote) = self.remote.get() {
            remote.spawn_message(self.local_id.clone(), message_type, payload);
        }
        Ok(())
    }
}

/// Pays every invoice and, once connected, tells the payee's service on its
/// own task.
#[derive(Default)]
pub struct MockLightning {
    pub invoices: Mutex<Vec<(SwapId, InvoicePurpose, u64)>>,
    pub payments: Mutex<Vec<(SwapId, InvoicePurpose, String)>>,
    pub fail_payments: AtomicBool,
    payee: OnceLock<SwapService>,
}

impl MockLightning {
    pub fn connect(&self, payee: SwapService) {
        let _ = self.payee.set(payee);
    }

    pub fn payment_count(&self, purpose: InvoicePurpose) -> usize {
        self.payments
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p, _)| *p == purpose)
            .count()
    }
}

#[async_trait]
impl LightningClient for MockLightning {
    async fn create_invoice(
        &self,
        swap_id: &SwapId,
        purpose: InvoicePurpose,
        amount_msat: u64,
    ) -> Result<String> {
        self.invoices
            .lock()
            .unwrap()
            .push((swap_id.clone(), purpose, amount_msat));
        Ok(format!("lnbcrt{amount_msat}{purpose:?}{swap_id}").to_lowercase())
    }

    async fn pay_invoice(
        &self,
        swap_id: &SwapId,
        purpose: InvoicePurpose,
        invoice: &str,
    ) -> Result<String> {
        anyhow::ensure!(!self.fail_payments.load(Ordering::SeqCst), "no route");
        self.payments
            .lock()
            .unwrap()
            .push((swap_id.clone(), purpose, invoice.to_string()));
        if let Some(payee) = self.payee.get() {
            let payee = payee.clone();
            let swap_id = swap_id.clone();
            tokio::spawn(async move { payee.on_invoice_paid(&swap_id, purpose).await });
        }
        Ok("11".repeat(32))
    }
}

pub struct MockWallet {
    pub balance: u64,
    pub openings: AtomicUsize,
    pub claims: Mutex<Vec<Broadcast>>,
    pub validated: Mutex<Vec<String>>,
    pub reject_openings: AtomicBool,
    pub fail_claims: AtomicBool,
}

impl MockWallet {
    pub fn new(balance: u64) -> Self {
        Self {
            balance,
            openings: AtomicUsize::new(0),
            claims: Mutex::new(Vec::new()),
            validated: Mutex::new(Vec::new()),
            reject_openings: AtomicBool::new(false),
            fail_claims: AtomicBool::new(false),
        }
    }
}

pub const OPENING_START_HEIGHT: u32 = 100;
pub const CLAIM_TX_ID: &str = "cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd";

#[async_trait]
impl Wallet for MockWallet {
    async fn get_address(&self) -> Result<String> {
        Ok("bcrt1qtest".to_string())
    }

    async fn get_balance(&self) -> Result<u64> {
        Ok(self.balance)
    }

    async fn send_to_address(&self, _address: &str, _amount_sat: u64) -> Result<String> {
        Ok("ef".repeat(32))
    }

    async fn pubkey_hash(&self, _swap_id: &SwapId) -> Result<String> {
        Ok("22".repeat(20))
    }

    async fn swap_out_fee(&self, _record: &SwapRecord) -> Result<u64> {
        Ok(250)
    }

    async fn create_and_broadcast_opening(&self, record: &SwapRecord) -> Result<OpeningTx> {
        self.openings.fetch_add(1, Ordering::SeqCst);
        // Deterministic per swap, so a repeated call yields the same tx.
        Ok(OpeningTx {
            tx_id: record.id.to_string(),
            vout: 0,
            tx_hex: "0200000000".to_string(),
            script_pubkey: format!("0020{}", "33".repeat(32)),
            start_height: OPENING_START_HEIGHT,
            csv: Config::default().chain_params(&record.asset).csv,
        })
    }

    async fn validate_opening_tx(&self, _record: &SwapRecord, tx_hex: &str) -> Result<bool> {
        self.validated.lock().unwrap().push(tx_hex.to_string());
        Ok(!self.reject_openings.load(Ordering::SeqCst))
    }

    async fn create_claim_transaction(&self, _record: &SwapRecord, claim: Broadcast) -> Result<String> {
        anyhow::ensure!(!self.fail_claims.load(Ordering::SeqCst), "claim rejected by mempool");
        self.claims.lock().unwrap().push(claim);
        Ok(CLAIM_TX_ID.to_string())
    }
}

/// Reports every observed output as confirmed at a fixed height.
pub struct ConfirmedAt(pub u32);

#[async_trait]
impl ConfirmationSource for ConfirmedAt {
    async fn confirmed_height(&self, _observation: &Observation, _current: u32) -> Result<Option<u32>> {
        Ok(Some(self.0))
    }

    async fn raw_transaction(&self, _tx_id: &str) -> Result<Option<String>> {
        Ok(Some("0200000000".to_string()))
    }
}

/// Memory store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemorySwapStore,
    pub fail_puts: AtomicBool,
}

impl SwapStore for FlakyStore {
    fn put(&self, record: &SwapRecord) -> Result<()> {
        anyhow::ensure!(!self.fail_puts.load(Ordering::SeqCst), "disk full");
        self.inner.put(record)
    }

    fn get(&self, swap_id: &SwapId) -> Result<Option<SwapRecord>> {
        self.inner.get(swap_id)
    }

    fn list(&self) -> Result<Vec<SwapRecord>> {
        self.inner.list()
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_meta(key)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_meta(key, value)
    }
}

pub fn test_config() -> Config {
    Config {
        accept_all_peers: true,
        min_swap_amount_sat: 1_000,
        ..Config::default()
    }
}

pub struct Node {
    pub service: SwapService,
    pub messenger: Arc<PeerLink>,
    pub lightning: Arc<MockLightning>,
    pub wallet: Arc<MockWallet>,
    pub policy: Arc<ConfigPolicy>,
    pub store: Arc<dyn SwapStore>,
    pub watcher: Arc<TxWatcher>,
    pub chain_events: Mutex<Option<mpsc::UnboundedReceiver<ChainEvent>>>,
}

impl Node {
    pub fn new(local_id: &str, cfg: Config) -> Self {
        Self::with_store(local_id, cfg, Arc::new(MemorySwapStore::new()))
    }

    pub fn with_store(local_id: &str, cfg: Config, store: Arc<dyn SwapStore>) -> Self {
        let messenger = Arc::new(PeerLink::new(local_id));
        let lightning = Arc::new(MockLightning::default());
        let wallet = Arc::new(MockWallet::new(50_000_000));
        let policy = Arc::new(ConfigPolicy::new(&cfg));
        let (watcher, rx) = TxWatcher::new();
        let watcher = Arc::new(watcher);

        let service = SwapService::new(
            cfg,
            local_id,
            ServiceDeps {
                messenger: messenger.clone(),
                lightning: lightning.clone(),
                wallets: Wallets {
                    bitcoin: Some(wallet.clone() as Arc<dyn Wallet>),
                    liquid: None,
                },
                policy: policy.clone(),
                store: store.clone(),
                watcher: watcher.clone(),
            },
        );

        Self {
            service,
            messenger,
            lightning,
            wallet,
            policy,
            store,
            watcher,
            chain_events: Mutex::new(Some(rx)),
        }
    }

    /// Feeds one block height to the watcher and hands the fired events to
    /// the service.
    pub async fn mine_to(&self, height: u32, source: &ConfirmedAt) -> Result<usize> {
        let fired = self.watcher.process_height(height, source).await;
        let events: Vec<ChainEvent> = {
            let mut guard = self.chain_events.lock().unwrap();
            let rx = guard.as_mut().expect("chain events taken");
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        for event in events {
            self.service.on_chain_event(event).await?;
        }
        Ok(fired)
    }
}

/// Two nodes whose messengers deliver to each other.
pub fn linked_pair(cfg: Config) -> (Node, Node) {
    let alice = Node::new("alice", cfg.clone());
    let bob = Node::new("bob", cfg);
    alice.messenger.connect(bob.service.clone());
    bob.messenger.connect(alice.service.clone());
    (alice, bob)
}

pub fn encode(message: &PeerMessage) -> (u16, Vec<u8>) {
    let (kind, payload) = messages::encode(message).unwrap();
    (kind.code(), payload)
}
