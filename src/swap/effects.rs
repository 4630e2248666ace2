//! Inputs and outputs of the swap state machine.

use serde::{Deserialize, Serialize};

use super::{SwapRecord, SwapState};
use crate::messages::PeerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoicePurpose {
    /// Swap-out prepayment covering the maker's opening transaction fee.
    Fee,
    /// Payment of the swap amount; its preimage unlocks the on-chain claim.
    Claim,
}

/// Opening transaction as reported by the wallet after broadcasting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpeningTx {
    pub tx_id: String,
    pub vout: u32,
    pub tx_hex: String,
    pub script_pubkey: String,
    pub start_height: u32,
    pub csv: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapEvent {
    /// Local command that begins a sender swap.
    Start,
    /// Local command to abandon the swap.
    Cancel { reason: String },
    Message(PeerMessage),
    /// The opening transaction reached the confirmation depth.
    TxConfirmed { tx_hex: Option<String> },
    /// The relative timeout of the opening output elapsed.
    CsvPassed,
    /// An invoice issued by the local node was paid by the peer.
    InvoiceSettled { purpose: InvoicePurpose },
    InvoiceCreated { purpose: InvoicePurpose, invoice: String },
    /// The local node paid the peer's invoice.
    InvoicePaid { purpose: InvoicePurpose, preimage: String },
    OpeningBroadcasted(OpeningTx),
    /// The wallet checked the confirmed opening tx against the swap terms.
    OpeningValidated,
    ClaimBroadcasted { tx_id: String },
    ActionFailed { reason: String },
}

impl SwapEvent {
    /// Local commands are never treated as stale replays.
    pub fn is_command(&self) -> bool {
        matches!(self, SwapEvent::Start | SwapEvent::Cancel { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SwapEvent::Start => "start",
            SwapEvent::Cancel { .. } => "cancel",
            SwapEvent::Message(_) => "message",
            SwapEvent::TxConfirmed { .. } => "tx_confirmed",
            SwapEvent::CsvPassed => "csv_passed",
            SwapEvent::InvoiceSettled { .. } => "invoice_settled",
            SwapEvent::InvoiceCreated { .. } => "invoice_created",
            SwapEvent::InvoicePaid { .. } => "invoice_paid",
            SwapEvent::OpeningBroadcasted(_) => "opening_broadcasted",
            SwapEvent::OpeningValidated => "opening_validated",
            SwapEvent::ClaimBroadcasted { .. } => "claim_broadcasted",
            SwapEvent::ActionFailed { .. } => "action_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    Opening,
    ClaimPreimage,
    ClaimCsv,
    ClaimCoop,
}

/// Output the chain watcher has to observe for a swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub tx_id: String,
    pub vout: u32,
    pub start_height: u32,
    pub script_pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send { message: PeerMessage, retry: bool },
    StopRetry,
    WatchConfirmation(Watch),
    WatchTimeout(Watch),
    /// Drops every chain watch of the swap.
    Unwatch,
    RequestBroadcast(Broadcast),
    /// Checks the maker's opening tx before anything is paid for it.
    ValidateOpening { tx_hex: String },
    PayInvoice { purpose: InvoicePurpose, invoice: String },
    CreateInvoice { purpose: InvoicePurpose },
    ReportSuspiciousPeer,
    /// Releases every in-memory registration of a canceled swap.
    Cancel { reason: String },
    Persist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Record after the event; `record.current` is the next state.
    pub record: SwapRecord,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn next(&self) -> SwapState {
        self.record.current
    }
}

/// What recovery has to do to continue a persisted swap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePlan {
    pub effects: Vec<Effect>,
    pub event: Option<SwapEvent>,
}
