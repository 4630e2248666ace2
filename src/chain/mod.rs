//! Turns blockchain state into one-shot swap events.
//!
//! [`TxWatcher`] holds the registrations; a backend loop ([`polling`] or
//! [`electrum`]) feeds it block heights and confirmation lookups.

pub mod electrum;
pub mod polling;
pub mod watcher;

use crate::swap::SwapId;

pub use watcher::{ConfirmationSource, Observation, TxWatcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEventKind {
    /// The opening output reached the confirmation depth.
    Confirmed { tx_hex: Option<String> },
    /// The csv delay of the opening output elapsed.
    CsvPassed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub swap_id: SwapId,
    pub kind: ChainEventKind,
}
