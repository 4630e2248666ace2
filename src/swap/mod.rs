pub mod effects;
pub mod fsm;
pub mod service;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Globally unique swap identifier: 32 random bytes, shown as hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapId([u8; 32]);

impl SwapId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for SwapId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapId({self})")
    }
}

impl FromStr for SwapId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("invalid swap id {s:?}: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("swap id must be 32 bytes: {s:?}"))?;
        Ok(Self(bytes))
    }
}

impl Serialize for SwapId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SwapId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Direction of the trade relative to the local channel liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapType {
    /// On-chain funds go out, channel liquidity comes in.
    SwapIn,
    /// Channel liquidity goes out, on-chain funds come in.
    SwapOut,
}

impl fmt::Display for SwapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapType::SwapIn => f.write_str("swap_in"),
            SwapType::SwapOut => f.write_str("swap_out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapRole {
    /// Initiated the swap locally.
    Sender,
    /// Accepted a peer's request.
    Receiver,
}

impl fmt::Display for SwapRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapRole::Sender => f.write_str("sender"),
            SwapRole::Receiver => f.write_str("receiver"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    Btc,
    /// Liquid asset identified by its hex asset id.
    Liquid(String),
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Btc => f.write_str("btc"),
            Asset::Liquid(asset_id) => write!(f, "liquid:{asset_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Preimage,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    // sender: waiting for the peer to accept the request
    AwaitAgreement,
    // swap-out receiver
    SendFeeInvoice,
    AwaitFeeInvoicePayment,
    // swap-out sender
    PayFeeInvoice,
    // taker
    AwaitTxBroadcastedMessage,
    AwaitTxConfirmation,
    PayClaimInvoice,
    ClaimSwapPreimage,
    // maker
    BroadcastOpeningTx,
    SendTxBroadcastedMessage,
    AwaitClaim,
    WaitCsv,
    ClaimSwapCsv,
    ClaimSwapCoop,
    // terminal
    ClaimedPreimage,
    ClaimedCsv,
    ClaimedCoop,
    Canceled,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapState::ClaimedPreimage
                | SwapState::ClaimedCsv
                | SwapState::ClaimedCoop
                | SwapState::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapState::Created => "created",
            SwapState::AwaitAgreement => "await_agreement",
            SwapState::SendFeeInvoice => "send_fee_invoice",
            SwapState::AwaitFeeInvoicePayment => "await_fee_invoice_payment",
            SwapState::PayFeeInvoice => "pay_fee_invoice",
            SwapState::AwaitTxBroadcastedMessage => "await_tx_broadcasted_message",
            SwapState::AwaitTxConfirmation => "await_tx_confirmation",
            SwapState::PayClaimInvoice => "pay_claim_invoice",
            SwapState::ClaimSwapPreimage => "claim_swap_preimage",
            SwapState::BroadcastOpeningTx => "broadcast_opening_tx",
            SwapState::SendTxBroadcastedMessage => "send_tx_broadcasted_message",
            SwapState::AwaitClaim => "await_claim",
            SwapState::WaitCsv => "wait_csv",
            SwapState::ClaimSwapCsv => "claim_swap_csv",
            SwapState::ClaimSwapCoop => "claim_swap_coop",
            SwapState::ClaimedPreimage => "claimed_preimage",
            SwapState::ClaimedCsv => "claimed_csv",
            SwapState::ClaimedCoop => "claimed_coop",
            SwapState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one swap. Only its own state machine mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: SwapId,
    pub swap_type: SwapType,
    pub role: SwapRole,
    pub current: SwapState,
    pub previous: Option<SwapState>,

    pub peer_node_id: String,
    pub initiator_node_id: String,
    pub protocol_version: u64,

    pub amount: u64,
    pub asset: Asset,
    pub channel_id: String,

    pub taker_pubkey_hash: Option<String>,
    pub maker_pubkey_hash: Option<String>,
    pub fee_invoice: Option<String>,
    pub claim_invoice: Option<String>,
    pub claim_preimage: Option<String>,

    pub opening_tx_id: Option<String>,
    pub opening_tx_vout: Option<u32>,
    pub opening_tx_hex: Option<String>,
    pub script_pubkey: Option<String>,
    pub start_height: Option<u32>,
    pub csv: Option<u32>,
    pub claim_tx_id: Option<String>,

    pub cancel_message: Option<String>,
    pub last_error: Option<String>,

    pub created_at: u64,
}

impl SwapRecord {
    /// Record for a swap initiated by the local node.
    pub fn new_sender(
        swap_type: SwapType,
        local_node_id: &str,
        peer_node_id: &str,
        asset: Asset,
        channel_id: &str,
        amount: u64,
    ) -> Self {
        Self::new(
            SwapId::random(),
            swap_type,
            SwapRole::Sender,
            peer_node_id,
            local_node_id,
            asset,
            channel_id,
            amount,
        )
    }

    /// Record for a swap requested by `peer_node_id`.
    pub fn new_receiver(
        id: SwapId,
        swap_type: SwapType,
        peer_node_id: &str,
        asset: Asset,
        channel_id: &str,
        amount: u64,
    ) -> Self {
        Self::new(
            id,
            swap_type,
            SwapRole::Receiver,
            peer_node_id,
            peer_node_id,
            asset,
            channel_id,
            amount,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: SwapId,
        swap_type: SwapType,
        role: SwapRole,
        peer_node_id: &str,
        initiator_node_id: &str,
        asset: Asset,
        channel_id: &str,
        amount: u64,
    ) -> Self {
        Self {
            id,
            swap_type,
            role,
            current: SwapState::Created,
            previous: None,
            peer_node_id: peer_node_id.to_string(),
            initiator_node_id: initiator_node_id.to_string(),
            protocol_version: crate::messages::PROTOCOL_VERSION,
            amount,
            asset,
            channel_id: channel_id.to_string(),
            taker_pubkey_hash: None,
            maker_pubkey_hash: None,
            fee_invoice: None,
            claim_invoice: None,
            claim_preimage: None,
            opening_tx_id: None,
            opening_tx_vout: None,
            opening_tx_hex: None,
            script_pubkey: None,
            start_height: None,
            csv: None,
            claim_tx_id: None,
            cancel_message: None,
            last_error: None,
            created_at: unix_now(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.current.is_terminal()
    }

    /// The maker broadcasts the opening transaction and is paid over
    /// Lightning; the taker pays and claims on-chain.
    pub fn is_maker(&self) -> bool {
        matches!(
            (self.swap_type, self.role),
            (SwapType::SwapIn, SwapRole::Sender) | (SwapType::SwapOut, SwapRole::Receiver)
        )
    }

    pub fn amount_msat(&self) -> u64 {
        self.amount.saturating_mul(1000)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
