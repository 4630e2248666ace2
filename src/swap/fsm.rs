//! Transition tables of the four swap state graphs.
//!
//! The taker graphs (swap-out sender, swap-in receiver) end with the local
//! node paying the claim invoice and claiming the opening output with the
//! preimage. The maker graphs (swap-in sender, swap-out receiver) broadcast
//! the opening transaction and end when the claim invoice is paid, or by
//! reclaiming the output after the csv delay.
//!
//! [`transition`] is pure: it never performs I/O, it only returns the next
//! record and the effects the caller has to execute.

use std::str::FromStr as _;

use super::effects::{
    Broadcast, Effect, InvoicePurpose, OpeningTx, ResumePlan, SwapEvent, Transition, Watch,
};
use super::{ClaimType, SwapRecord, SwapRole, SwapState, SwapType};
use crate::messages::{self, PeerMessage};

use SwapState::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
    #[error("unexpected event {event} in state {state} ({swap_type} {role})")]
    UnexpectedEvent {
        state: SwapState,
        event: &'static str,
        swap_type: SwapType,
        role: SwapRole,
    },
}

const SWAP_OUT_SENDER: &[SwapState] = &[
    Created,
    AwaitAgreement,
    PayFeeInvoice,
    AwaitTxBroadcastedMessage,
    AwaitTxConfirmation,
    PayClaimInvoice,
    ClaimSwapPreimage,
    ClaimedPreimage,
    ClaimedCoop,
    Canceled,
];

const SWAP_IN_RECEIVER: &[SwapState] = &[
    Created,
    AwaitTxBroadcastedMessage,
    AwaitTxConfirmation,
    PayClaimInvoice,
    ClaimSwapPreimage,
    ClaimedPreimage,
    ClaimedCoop,
    Canceled,
];

const SWAP_IN_SENDER: &[SwapState] = &[
    Created,
    AwaitAgreement,
    BroadcastOpeningTx,
    SendTxBroadcastedMessage,
    AwaitClaim,
    WaitCsv,
    ClaimSwapCoop,
    ClaimSwapCsv,
    ClaimedPreimage,
    ClaimedCsv,
    ClaimedCoop,
    Canceled,
];

const SWAP_OUT_RECEIVER: &[SwapState] = &[
    Created,
    SendFeeInvoice,
    AwaitFeeInvoicePayment,
    BroadcastOpeningTx,
    SendTxBroadcastedMessage,
    AwaitClaim,
    WaitCsv,
    ClaimSwapCoop,
    ClaimSwapCsv,
    ClaimedPreimage,
    ClaimedCsv,
    ClaimedCoop,
    Canceled,
];

/// States of the `(swap_type, role)` graph in protocol order, terminal
/// states last.
pub fn states(swap_type: SwapType, role: SwapRole) -> &'static [SwapState] {
    match (swap_type, role) {
        (SwapType::SwapOut, SwapRole::Sender) => SWAP_OUT_SENDER,
        (SwapType::SwapOut, SwapRole::Receiver) => SWAP_OUT_RECEIVER,
        (SwapType::SwapIn, SwapRole::Sender) => SWAP_IN_SENDER,
        (SwapType::SwapIn, SwapRole::Receiver) => SWAP_IN_RECEIVER,
    }
}

/// Applies `event` to `record`.
///
/// Returns `Ok(None)` when the event was already processed: it is accepted by
/// a state the swap has left, so it is a duplicate or late delivery.
pub fn transition(record: &SwapRecord, event: &SwapEvent) -> Result<Option<Transition>, FsmError> {
    let mut next = record.clone();
    let mut effects = Vec::new();

    if let Some(state) = step(record, event, &mut next, &mut effects) {
        if state != record.current {
            next.previous = Some(record.current);
        }
        next.current = state;
        effects.push(Effect::Persist);
        return Ok(Some(Transition {
            record: next,
            effects,
        }));
    }

    if is_replay(record, event) {
        return Ok(None);
    }

    Err(FsmError::UnexpectedEvent {
        state: record.current,
        event: event.name(),
        swap_type: record.swap_type,
        role: record.role,
    })
}

fn is_replay(record: &SwapRecord, event: &SwapEvent) -> bool {
    if event.is_command() {
        return false;
    }

    let graph = states(record.swap_type, record.role);
    let earlier: Vec<SwapState> = if record.current.is_terminal() {
        graph.iter().copied().filter(|s| !s.is_terminal()).collect()
    } else {
        graph
            .iter()
            .copied()
            .take_while(|s| *s != record.current)
            .collect()
    };

    earlier.into_iter().any(|state| {
        let mut candidate = record.clone();
        candidate.current = state;
        let mut scratch = candidate.clone();
        step(&candidate, event, &mut scratch, &mut Vec::new()).is_some()
    })
}

fn step(
    record: &SwapRecord,
    event: &SwapEvent,
    next: &mut SwapRecord,
    effects: &mut Vec<Effect>,
) -> Option<SwapState> {
    if record.current.is_terminal() {
        return None;
    }
    if record.is_maker() {
        maker_step(record, event, next, effects)
    } else {
        taker_step(record, event, next, effects)
    }
}

fn taker_step(
    record: &SwapRecord,
    event: &SwapEvent,
    next: &mut SwapRecord,
    effects: &mut Vec<Effect>,
) -> Option<SwapState> {
    let swap_out_sender = record.swap_type == SwapType::SwapOut && record.role == SwapRole::Sender;

    let state = match (record.current, event) {
        (Created, SwapEvent::Start) if swap_out_sender => {
            effects.push(Effect::Send {
                message: request_message(record)?,
                retry: true,
            });
            AwaitAgreement
        }
        (Created, SwapEvent::Message(PeerMessage::SwapInRequest(_))) if !swap_out_sender => {
            effects.push(Effect::Send {
                message: agreement_message(record)?,
                retry: true,
            });
            AwaitTxBroadcastedMessage
        }
        (Created, SwapEvent::Cancel { reason }) => cancel(record, next, effects, reason, false),

        (AwaitAgreement, SwapEvent::Message(PeerMessage::SwapOutAgreement(m))) => {
            next.maker_pubkey_hash = Some(m.maker_pubkey_hash.clone());
            next.fee_invoice = Some(m.fee_invoice.clone());
            effects.push(Effect::StopRetry);
            effects.push(Effect::PayInvoice {
                purpose: InvoicePurpose::Fee,
                invoice: m.fee_invoice.clone(),
            });
            PayFeeInvoice
        }

        (
            PayFeeInvoice,
            SwapEvent::InvoicePaid {
                purpose: InvoicePurpose::Fee,
                ..
            },
        ) => AwaitTxBroadcastedMessage,
        (PayFeeInvoice, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            cancel(record, next, effects, reason, true)
        }

        (AwaitAgreement | AwaitTxBroadcastedMessage, SwapEvent::Message(PeerMessage::Canceled(m))) => {
            peer_canceled(next, effects, &m.message)
        }
        (AwaitAgreement | AwaitTxBroadcastedMessage, SwapEvent::Cancel { reason }) => {
            cancel(record, next, effects, reason, true)
        }

        (AwaitTxBroadcastedMessage, SwapEvent::Message(PeerMessage::OpeningTxBroadcasted(m))) => {
            if let Err(reason) = validate_opening_message(record, m) {
                let reason = format!("invalid opening tx message: {reason}");
                next.last_error = Some(reason.clone());
                return Some(cancel(record, next, effects, &reason, true));
            }
            if !set_opening_tx_id(next, &m.tx_id) {
                return None;
            }
            next.maker_pubkey_hash = Some(m.maker_pubkey_hash.clone());
            next.claim_invoice = Some(m.invoice.clone());
            next.opening_tx_vout = Some(m.vout);
            next.script_pubkey = Some(m.script_pubkey.clone());
            next.csv = Some(m.csv);
            effects.push(Effect::StopRetry);
            effects.push(Effect::WatchConfirmation(opening_watch(next)?));
            AwaitTxConfirmation
        }

        // Nothing to validate without the transaction: look again next block.
        (AwaitTxConfirmation, SwapEvent::TxConfirmed { tx_hex: None }) => {
            next.last_error = Some("confirmed opening tx not available".to_string());
            effects.push(Effect::WatchConfirmation(opening_watch(record)?));
            AwaitTxConfirmation
        }
        (
            AwaitTxConfirmation,
            SwapEvent::TxConfirmed {
                tx_hex: Some(tx_hex),
            },
        ) => {
            next.opening_tx_hex = Some(tx_hex.clone());
            next.last_error = None;
            effects.push(Effect::ValidateOpening {
                tx_hex: tx_hex.clone(),
            });
            PayClaimInvoice
        }
        // The opening output exists: keep watching it, only note the reason.
        (AwaitTxConfirmation, SwapEvent::Message(PeerMessage::Canceled(m))) => {
            next.cancel_message = Some(m.message.clone());
            AwaitTxConfirmation
        }
        (AwaitTxConfirmation, SwapEvent::Cancel { reason }) => {
            coop_close(record, next, effects, reason)
        }

        (PayClaimInvoice, SwapEvent::OpeningValidated) => {
            effects.push(Effect::PayInvoice {
                purpose: InvoicePurpose::Claim,
                invoice: record.claim_invoice.clone()?,
            });
            PayClaimInvoice
        }
        (
            PayClaimInvoice,
            SwapEvent::InvoicePaid {
                purpose: InvoicePurpose::Claim,
                preimage,
            },
        ) => {
            next.claim_preimage = Some(preimage.clone());
            effects.push(Effect::Unwatch);
            effects.push(Effect::RequestBroadcast(Broadcast::ClaimPreimage));
            ClaimSwapPreimage
        }
        (PayClaimInvoice, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            coop_close(record, next, effects, reason)
        }

        (ClaimSwapPreimage, SwapEvent::ClaimBroadcasted { tx_id }) => {
            next.claim_tx_id = Some(tx_id.clone());
            next.last_error = None;
            effects.push(Effect::Send {
                message: PeerMessage::Claimed(messages::Claimed {
                    swap_id: record.id.clone(),
                    claim_type: ClaimType::Preimage,
                    claim_tx_id: tx_id.clone(),
                }),
                retry: false,
            });
            ClaimedPreimage
        }
        // Stuck until the claim succeeds; the preimage is already spent on
        // Lightning, so the swap must stay visible and retryable.
        (ClaimSwapPreimage, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            ClaimSwapPreimage
        }

        _ => return None,
    };
    Some(state)
}

fn maker_step(
    record: &SwapRecord,
    event: &SwapEvent,
    next: &mut SwapRecord,
    effects: &mut Vec<Effect>,
) -> Option<SwapState> {
    let swap_in_sender = record.swap_type == SwapType::SwapIn && record.role == SwapRole::Sender;

    let state = match (record.current, event) {
        (Created, SwapEvent::Start) if swap_in_sender => {
            effects.push(Effect::Send {
                message: request_message(record)?,
                retry: true,
            });
            AwaitAgreement
        }
        (Created, SwapEvent::Message(PeerMessage::SwapOutRequest(m))) if !swap_in_sender => {
            next.taker_pubkey_hash = Some(m.taker_pubkey_hash.clone());
            effects.push(Effect::CreateInvoice {
                purpose: InvoicePurpose::Fee,
            });
            SendFeeInvoice
        }
        (Created, SwapEvent::Cancel { reason }) => cancel(record, next, effects, reason, false),

        (
            SendFeeInvoice,
            SwapEvent::InvoiceCreated {
                purpose: InvoicePurpose::Fee,
                invoice,
            },
        ) => {
            next.fee_invoice = Some(invoice.clone());
            effects.push(Effect::Send {
                message: agreement_message(next)?,
                retry: true,
            });
            AwaitFeeInvoicePayment
        }
        (SendFeeInvoice, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            cancel(record, next, effects, reason, true)
        }

        (AwaitAgreement, SwapEvent::Message(PeerMessage::SwapInAgreement(m))) => {
            next.taker_pubkey_hash = Some(m.taker_pubkey_hash.clone());
            effects.push(Effect::StopRetry);
            effects.push(Effect::RequestBroadcast(Broadcast::Opening));
            BroadcastOpeningTx
        }
        (
            AwaitFeeInvoicePayment,
            SwapEvent::InvoiceSettled {
                purpose: InvoicePurpose::Fee,
            },
        ) => {
            effects.push(Effect::StopRetry);
            effects.push(Effect::RequestBroadcast(Broadcast::Opening));
            BroadcastOpeningTx
        }
        (AwaitAgreement | AwaitFeeInvoicePayment, SwapEvent::Message(PeerMessage::Canceled(m))) => {
            peer_canceled(next, effects, &m.message)
        }
        (AwaitAgreement | AwaitFeeInvoicePayment, SwapEvent::Cancel { reason }) => {
            cancel(record, next, effects, reason, true)
        }

        (BroadcastOpeningTx, SwapEvent::OpeningBroadcasted(tx)) => {
            if !set_opening_tx_id(next, &tx.tx_id) {
                return None;
            }
            apply_opening_tx(next, tx);
            effects.push(Effect::WatchTimeout(opening_watch(next)?));
            effects.push(Effect::CreateInvoice {
                purpose: InvoicePurpose::Claim,
            });
            SendTxBroadcastedMessage
        }
        (BroadcastOpeningTx, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            cancel(record, next, effects, reason, true)
        }

        (
            SendTxBroadcastedMessage,
            SwapEvent::InvoiceCreated {
                purpose: InvoicePurpose::Claim,
                invoice,
            },
        ) => {
            next.claim_invoice = Some(invoice.clone());
            effects.push(Effect::Send {
                message: opening_message(next)?,
                retry: true,
            });
            AwaitClaim
        }
        // Funds are locked on-chain: tell the peer and fall back to the
        // timeout path.
        (SendTxBroadcastedMessage, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            next.cancel_message = Some(reason.clone());
            effects.push(Effect::Send {
                message: canceled_message(record, reason),
                retry: false,
            });
            effects.push(Effect::WatchTimeout(opening_watch(record)?));
            WaitCsv
        }

        (
            AwaitClaim | WaitCsv,
            SwapEvent::InvoiceSettled {
                purpose: InvoicePurpose::Claim,
            },
        ) => {
            effects.push(Effect::StopRetry);
            effects.push(Effect::Unwatch);
            ClaimedPreimage
        }
        (AwaitClaim | WaitCsv, SwapEvent::Message(PeerMessage::Claimed(m)))
            if m.claim_type == ClaimType::Preimage =>
        {
            next.claim_tx_id = Some(m.claim_tx_id.clone());
            effects.push(Effect::StopRetry);
            effects.push(Effect::Unwatch);
            ClaimedPreimage
        }
        (AwaitClaim, SwapEvent::Message(PeerMessage::Canceled(m))) => {
            next.cancel_message = Some(m.message.clone());
            effects.push(Effect::StopRetry);
            effects.push(Effect::WatchTimeout(opening_watch(record)?));
            WaitCsv
        }
        (WaitCsv, SwapEvent::Message(PeerMessage::Canceled(m))) => {
            next.cancel_message = Some(m.message.clone());
            WaitCsv
        }
        (AwaitClaim | WaitCsv, SwapEvent::Message(PeerMessage::CoopClose(m))) => {
            next.cancel_message = Some(m.message.clone());
            effects.push(Effect::StopRetry);
            effects.push(Effect::RequestBroadcast(Broadcast::ClaimCoop));
            ClaimSwapCoop
        }
        (AwaitClaim | WaitCsv, SwapEvent::CsvPassed) => {
            effects.push(Effect::StopRetry);
            effects.push(Effect::RequestBroadcast(Broadcast::ClaimCsv));
            ClaimSwapCsv
        }

        (ClaimSwapCoop, SwapEvent::ClaimBroadcasted { tx_id }) => {
            next.claim_tx_id = Some(tx_id.clone());
            next.last_error = None;
            effects.push(Effect::Unwatch);
            ClaimedCoop
        }
        (ClaimSwapCoop, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            effects.push(Effect::WatchTimeout(opening_watch(record)?));
            WaitCsv
        }

        (ClaimSwapCsv, SwapEvent::ClaimBroadcasted { tx_id }) => {
            next.claim_tx_id = Some(tx_id.clone());
            next.last_error = None;
            effects.push(Effect::Send {
                message: PeerMessage::Claimed(messages::Claimed {
                    swap_id: record.id.clone(),
                    claim_type: ClaimType::Timeout,
                    claim_tx_id: tx_id.clone(),
                }),
                retry: false,
            });
            effects.push(Effect::ReportSuspiciousPeer);
            ClaimedCsv
        }
        (ClaimSwapCsv, SwapEvent::ActionFailed { reason }) => {
            next.last_error = Some(reason.clone());
            ClaimSwapCsv
        }

        _ => return None,
    };
    Some(state)
}

fn cancel(
    record: &SwapRecord,
    next: &mut SwapRecord,
    effects: &mut Vec<Effect>,
    reason: &str,
    notify_peer: bool,
) -> SwapState {
    next.cancel_message = Some(reason.to_string());
    effects.push(Effect::Cancel {
        reason: reason.to_string(),
    });
    if notify_peer {
        effects.push(Effect::Send {
            message: canceled_message(record, reason),
            retry: false,
        });
    }
    Canceled
}

fn peer_canceled(next: &mut SwapRecord, effects: &mut Vec<Effect>, message: &str) -> SwapState {
    next.cancel_message = Some(message.to_string());
    effects.push(Effect::Cancel {
        reason: format!("canceled by peer: {message}"),
    });
    Canceled
}

/// Taker gives up a confirmed opening output so the maker can spend it
/// right away instead of waiting for the csv delay.
fn coop_close(
    record: &SwapRecord,
    next: &mut SwapRecord,
    effects: &mut Vec<Effect>,
    reason: &str,
) -> SwapState {
    next.cancel_message = Some(reason.to_string());
    effects.push(Effect::Unwatch);
    effects.push(Effect::Send {
        message: PeerMessage::CoopClose(messages::CoopClose {
            swap_id: record.id.clone(),
            message: reason.to_string(),
        }),
        retry: false,
    });
    ClaimedCoop
}

fn set_opening_tx_id(next: &mut SwapRecord, tx_id: &str) -> bool {
    match &next.opening_tx_id {
        Some(existing) => existing == tx_id,
        None => {
            next.opening_tx_id = Some(tx_id.to_string());
            true
        }
    }
}

fn apply_opening_tx(next: &mut SwapRecord, tx: &OpeningTx) {
    next.opening_tx_vout = Some(tx.vout);
    next.opening_tx_hex = Some(tx.tx_hex.clone());
    next.script_pubkey = Some(tx.script_pubkey.clone());
    next.start_height = Some(tx.start_height);
    next.csv = Some(tx.csv);
}

/// The taker only accepts an output locked with the csv agreed for the
/// chain, in a v0 witness script hash.
fn validate_opening_message(
    record: &SwapRecord,
    m: &messages::OpeningTxBroadcasted,
) -> Result<(), String> {
    bitcoin::Txid::from_str(&m.tx_id).map_err(|e| format!("tx_id {:?}: {e}", m.tx_id))?;
    let script = hex::decode(&m.script_pubkey).map_err(|e| format!("script_pubkey: {e}"))?;
    if script.len() != 34 || script[..2] != [0x00, 0x20] {
        return Err(format!("script_pubkey {} is not p2wsh", m.script_pubkey));
    }
    if m.invoice.trim().is_empty() {
        return Err("missing claim invoice".to_string());
    }
    match record.csv {
        Some(csv) if csv == m.csv => Ok(()),
        Some(csv) => Err(format!("csv {} does not match the agreed {csv}", m.csv)),
        None => Err("no csv agreed for this swap".to_string()),
    }
}

pub fn opening_watch(record: &SwapRecord) -> Option<Watch> {
    Some(Watch {
        tx_id: record.opening_tx_id.clone()?,
        vout: record.opening_tx_vout?,
        start_height: record.start_height.unwrap_or_default(),
        script_pubkey: record.script_pubkey.clone()?,
    })
}

/// Request sent by the swap initiator.
pub fn request_message(record: &SwapRecord) -> Option<PeerMessage> {
    let message = match record.swap_type {
        SwapType::SwapIn => PeerMessage::SwapInRequest(messages::SwapInRequest {
            protocol_version: record.protocol_version,
            swap_id: record.id.clone(),
            asset: record.asset.clone(),
            channel_id: record.channel_id.clone(),
            amount: record.amount,
        }),
        SwapType::SwapOut => PeerMessage::SwapOutRequest(messages::SwapOutRequest {
            protocol_version: record.protocol_version,
            swap_id: record.id.clone(),
            asset: record.asset.clone(),
            channel_id: record.channel_id.clone(),
            amount: record.amount,
            taker_pubkey_hash: record.taker_pubkey_hash.clone()?,
        }),
    };
    Some(message)
}

/// Agreement sent by the receiver of a request.
pub fn agreement_message(record: &SwapRecord) -> Option<PeerMessage> {
    let message = match record.swap_type {
        SwapType::SwapIn => PeerMessage::SwapInAgreement(messages::SwapInAgreement {
            protocol_version: record.protocol_version,
            swap_id: record.id.clone(),
            taker_pubkey_hash: record.taker_pubkey_hash.clone()?,
        }),
        SwapType::SwapOut => PeerMessage::SwapOutAgreement(messages::SwapOutAgreement {
            protocol_version: record.protocol_version,
            swap_id: record.id.clone(),
            maker_pubkey_hash: record.maker_pubkey_hash.clone()?,
            fee_invoice: record.fee_invoice.clone()?,
        }),
    };
    Some(message)
}

pub fn opening_message(record: &SwapRecord) -> Option<PeerMessage> {
    Some(PeerMessage::OpeningTxBroadcasted(
        messages::OpeningTxBroadcasted {
            swap_id: record.id.clone(),
            maker_pubkey_hash: record.maker_pubkey_hash.clone()?,
            invoice: record.claim_invoice.clone()?,
            tx_id: record.opening_tx_id.clone()?,
            vout: record.opening_tx_vout?,
            script_pubkey: record.script_pubkey.clone()?,
            csv: record.csv?,
        },
    ))
}

fn canceled_message(record: &SwapRecord, reason: &str) -> PeerMessage {
    PeerMessage::Canceled(messages::Canceled {
        swap_id: record.id.clone(),
        message: reason.to_string(),
    })
}

/// Work needed to continue `record` after a restart.
///
/// Waiting states re-arm their watches and retried messages. States that
/// were in the middle of an action either fail (nothing irreversible
/// happened yet) or run the action again.
pub fn resume_plan(record: &SwapRecord) -> ResumePlan {
    let mut plan = ResumePlan::default();
    let fail = |reason: &str| SwapEvent::ActionFailed {
        reason: format!("recovered in state {}: {reason}", record.current),
    };

    match record.current {
        Created => {
            plan.event = Some(SwapEvent::Cancel {
                reason: "recovered before the swap request was answered".to_string(),
            });
        }
        AwaitAgreement => plan.effects.extend(retry(request_message(record))),
        SendFeeInvoice => plan.event = Some(fail("fee invoice was not sent")),
        AwaitFeeInvoicePayment => plan.effects.extend(retry(agreement_message(record))),
        PayFeeInvoice => plan.event = Some(fail("fee payment outcome unknown")),
        AwaitTxBroadcastedMessage => {
            if record.role == SwapRole::Receiver {
                plan.effects.extend(retry(agreement_message(record)));
            }
        }
        AwaitTxConfirmation => {
            plan.effects
                .extend(opening_watch(record).map(Effect::WatchConfirmation));
        }
        // Validation runs again before the payment is retried.
        PayClaimInvoice => match record.opening_tx_hex.clone() {
            Some(tx_hex) => plan.effects.push(Effect::ValidateOpening { tx_hex }),
            None => plan.event = Some(fail("confirmed opening tx unavailable")),
        },
        ClaimSwapPreimage => plan
            .effects
            .push(Effect::RequestBroadcast(Broadcast::ClaimPreimage)),
        BroadcastOpeningTx => plan
            .effects
            .push(Effect::RequestBroadcast(Broadcast::Opening)),
        SendTxBroadcastedMessage => {
            plan.effects
                .extend(opening_watch(record).map(Effect::WatchTimeout));
            plan.effects.push(Effect::CreateInvoice {
                purpose: InvoicePurpose::Claim,
            });
        }
        AwaitClaim => {
            plan.effects
                .extend(opening_watch(record).map(Effect::WatchTimeout));
            plan.effects.extend(retry(opening_message(record)));
        }
        WaitCsv => plan
            .effects
            .extend(opening_watch(record).map(Effect::WatchTimeout)),
        ClaimSwapCsv => plan
            .effects
            .push(Effect::RequestBroadcast(Broadcast::ClaimCsv)),
        ClaimSwapCoop => plan
            .effects
            .push(Effect::RequestBroadcast(Broadcast::ClaimCoop)),
        ClaimedPreimage | ClaimedCsv | ClaimedCoop | Canceled => {}
    }

    plan
}

fn retry(message: Option<PeerMessage>) -> Option<Effect> {
    message.map(|message| Effect::Send {
        message,
        retry: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::Asset;

    fn apply(record: &SwapRecord, event: SwapEvent) -> (SwapRecord, Vec<Effect>) {
        let t = transition(record, &event).unwrap().unwrap();
        assert_eq!(t.effects.last(), Some(&Effect::Persist));
        (t.record, t.effects)
    }

    fn swap_out_sender() -> SwapRecord {
        let mut record =
            SwapRecord::new_sender(SwapType::SwapOut, "me", "peer", Asset::Btc, "100x1x1", 10_000);
        record.taker_pubkey_hash = Some("11".repeat(20));
        record.csv = Some(1008);
        record
    }

    fn opening_msg(record: &SwapRecord, tx_id: &str) -> SwapEvent {
        SwapEvent::Message(PeerMessage::OpeningTxBroadcasted(
            messages::OpeningTxBroadcasted {
                swap_id: record.id.clone(),
                maker_pubkey_hash: "22".repeat(20),
                invoice: "lnbcrt-claim".to_string(),
                tx_id: tx_id.to_string(),
                vout: 1,
                script_pubkey: "0020".to_string() + &"33".repeat(32),
                csv: 1008,
            },
        ))
    }

    fn swap_in_sender_in(state: SwapState) -> SwapRecord {
        let mut record =
            SwapRecord::new_sender(SwapType::SwapIn, "me", "peer", Asset::Btc, "100x1x1", 10_000);
        record.current = state;
        record.maker_pubkey_hash = Some("22".repeat(20));
        record.opening_tx_id = Some("aa".repeat(32));
        record.opening_tx_vout = Some(0);
        record.script_pubkey = Some("0014".to_string() + &"44".repeat(20));
        record.start_height = Some(100);
        record.csv = Some(1008);
        record.claim_invoice = Some("lnbcrt-claim".to_string());
        record
    }

    #[test]
    fn swap_out_sender_claims_with_preimage() {
        let record = swap_out_sender();

        let (record, effects) = apply(&record, SwapEvent::Start);
        assert_eq!(record.current, AwaitAgreement);
        assert!(matches!(
            &effects[0],
            Effect::Send { message: PeerMessage::SwapOutRequest(m), retry: true }
                if m.amount == 10_000 && m.channel_id == "100x1x1"
        ));

        let agreement = SwapEvent::Message(PeerMessage::SwapOutAgreement(
            messages::SwapOutAgreement {
                protocol_version: 3,
                swap_id: record.id.clone(),
                maker_pubkey_hash: "22".repeat(20),
                fee_invoice: "lnbcrt-fee".to_string(),
            },
        ));
        let (record, effects) = apply(&record, agreement);
        assert_eq!(record.current, PayFeeInvoice);
        assert!(effects.contains(&Effect::PayInvoice {
            purpose: InvoicePurpose::Fee,
            invoice: "lnbcrt-fee".to_string(),
        }));

        let (record, _) = apply(
            &record,
            SwapEvent::InvoicePaid {
                purpose: InvoicePurpose::Fee,
                preimage: "00".repeat(32),
            },
        );
        assert_eq!(record.current, AwaitTxBroadcastedMessage);

        let (record, effects) = apply(&record, opening_msg(&record, &"ab".repeat(32)));
        assert_eq!(record.current, AwaitTxConfirmation);
        assert_eq!(record.opening_tx_id.as_deref(), Some("ab".repeat(32).as_str()));
        assert!(matches!(&effects[1], Effect::WatchConfirmation(w) if w.vout == 1));

        let (record, effects) = apply(
            &record,
            SwapEvent::TxConfirmed {
                tx_hex: Some("0200".to_string()),
            },
        );
        assert_eq!(record.current, PayClaimInvoice);
        assert_eq!(
            effects[0],
            Effect::ValidateOpening {
                tx_hex: "0200".to_string()
            }
        );
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::PayInvoice { .. }))
        );

        let (record, effects) = apply(&record, SwapEvent::OpeningValidated);
        assert_eq!(record.current, PayClaimInvoice);
        assert_eq!(
            effects[0],
            Effect::PayInvoice {
                purpose: InvoicePurpose::Claim,
                invoice: "lnbcrt-claim".to_string(),
            }
        );

        let (record, effects) = apply(
            &record,
            SwapEvent::InvoicePaid {
                purpose: InvoicePurpose::Claim,
                preimage: "55".repeat(32),
            },
        );
        assert_eq!(record.current, ClaimSwapPreimage);
        assert!(effects.contains(&Effect::RequestBroadcast(Broadcast::ClaimPreimage)));

        let (record, effects) = apply(
            &record,
            SwapEvent::ClaimBroadcasted {
                tx_id: "cd".repeat(32),
            },
        );
        assert_eq!(record.current, ClaimedPreimage);
        assert_eq!(record.previous, Some(ClaimSwapPreimage));
        assert!(matches!(
            &effects[0],
            Effect::Send { message: PeerMessage::Claimed(m), .. } if m.claim_type == ClaimType::Preimage
        ));
    }

    #[test]
    fn duplicate_message_is_a_noop() {
        let record = swap_out_sender();
        let (record, _) = apply(&record, SwapEvent::Start);
        let (record, _) = apply(
            &record,
            SwapEvent::Cancel {
                reason: "user".to_string(),
            },
        );
        assert_eq!(record.current, Canceled);

        let late = SwapEvent::Message(PeerMessage::Canceled(messages::Canceled {
            swap_id: record.id.clone(),
            message: "late".to_string(),
        }));
        assert_eq!(transition(&record, &late).unwrap(), None);

        // Commands are never replays.
        let err = transition(
            &record,
            &SwapEvent::Cancel {
                reason: "again".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, FsmError::UnexpectedEvent { state: Canceled, .. }));
    }

    #[test]
    fn unexpected_event_leaves_record_untouched() {
        let record = swap_out_sender();
        let err = transition(&record, &SwapEvent::CsvPassed).unwrap_err();
        assert_eq!(
            err,
            FsmError::UnexpectedEvent {
                state: Created,
                event: "csv_passed",
                swap_type: SwapType::SwapOut,
                role: SwapRole::Sender,
            }
        );
    }

    #[test]
    fn invalid_opening_message_cancels_the_taker() {
        let record = swap_out_sender();
        let mut record = apply(&record, SwapEvent::Start).0;
        record.current = AwaitTxBroadcastedMessage;

        let (record, effects) = apply(&record, opening_msg(&record, "not-a-txid"));
        assert_eq!(record.current, Canceled);
        assert!(record.opening_tx_id.is_none());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send { message: PeerMessage::Canceled(_), retry: false }
        )));
    }

    fn awaiting_opening() -> SwapRecord {
        let mut record = apply(&swap_out_sender(), SwapEvent::Start).0;
        record.current = AwaitTxBroadcastedMessage;
        record
    }

    fn with_opening(
        event: SwapEvent,
        edit: impl FnOnce(&mut messages::OpeningTxBroadcasted),
    ) -> SwapEvent {
        let SwapEvent::Message(PeerMessage::OpeningTxBroadcasted(mut m)) = event else {
            unreachable!()
        };
        edit(&mut m);
        SwapEvent::Message(PeerMessage::OpeningTxBroadcasted(m))
    }

    #[test]
    fn opening_with_foreign_terms_is_refused() {
        let record = awaiting_opening();
        let txid = "ab".repeat(32);

        let short_csv = with_opening(opening_msg(&record, &txid), |m| m.csv = 1);
        let (canceled, effects) = apply(&record, short_csv);
        assert_eq!(canceled.current, Canceled);
        assert!(canceled.last_error.as_deref().unwrap().contains("csv 1"));
        assert!(canceled.opening_tx_id.is_none());
        assert!(!effects.iter().any(|e| matches!(e, Effect::WatchConfirmation(_))));

        let bare_script = with_opening(opening_msg(&record, &txid), |m| {
            m.vout = 7;
            m.script_pubkey = "51".to_string();
        });
        let (canceled, _) = apply(&record, bare_script);
        assert_eq!(canceled.current, Canceled);
        assert!(canceled.last_error.as_deref().unwrap().contains("p2wsh"));

        let mut unagreed = record.clone();
        unagreed.csv = None;
        let (canceled, _) = apply(&unagreed, opening_msg(&unagreed, &txid));
        assert_eq!(canceled.current, Canceled);
    }

    #[test]
    fn rejected_opening_tx_is_never_paid() {
        let record = awaiting_opening();
        let (record, _) = apply(&record, opening_msg(&record, &"ab".repeat(32)));
        assert_eq!(record.current, AwaitTxConfirmation);

        // Without the raw tx the watch is armed again.
        let (record, effects) = apply(&record, SwapEvent::TxConfirmed { tx_hex: None });
        assert_eq!(record.current, AwaitTxConfirmation);
        assert!(matches!(&effects[0], Effect::WatchConfirmation(w) if w.vout == 1));

        let (record, _) = apply(
            &record,
            SwapEvent::TxConfirmed {
                tx_hex: Some("00".to_string()),
            },
        );
        assert_eq!(record.current, PayClaimInvoice);
        assert_eq!(record.opening_tx_hex.as_deref(), Some("00"));

        let (record, effects) = apply(
            &record,
            SwapEvent::ActionFailed {
                reason: "validate opening tx: output pays 1 sat".to_string(),
            },
        );
        assert_eq!(record.current, ClaimedCoop);
        assert!(record.last_error.as_deref().unwrap().contains("validate opening tx"));
        assert!(!effects.iter().any(|e| matches!(e, Effect::PayInvoice { .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send { message: PeerMessage::CoopClose(_), .. }
        )));
    }

    #[test]
    fn resume_validates_before_paying_again() {
        let mut record = swap_out_sender();
        record.current = PayClaimInvoice;
        record.claim_invoice = Some("lnbcrt-claim".to_string());
        record.opening_tx_hex = Some("0200".to_string());
        assert_eq!(
            resume_plan(&record).effects,
            vec![Effect::ValidateOpening {
                tx_hex: "0200".to_string()
            }]
        );

        record.opening_tx_hex = None;
        let plan = resume_plan(&record);
        assert!(plan.effects.is_empty());
        assert!(matches!(plan.event, Some(SwapEvent::ActionFailed { .. })));
    }

    #[test]
    fn maker_falls_back_to_csv_after_peer_cancel() {
        let record = swap_in_sender_in(AwaitClaim);
        let canceled = SwapEvent::Message(PeerMessage::Canceled(messages::Canceled {
            swap_id: record.id.clone(),
            message: "changed my mind".to_string(),
        }));

        let (record, effects) = apply(&record, canceled.clone());
        assert_eq!(record.current, WaitCsv);
        assert!(matches!(&effects[1], Effect::WatchTimeout(w) if w.start_height == 100));

        // Repeated cancel only updates bookkeeping.
        let (record, _) = apply(&record, canceled);
        assert_eq!(record.current, WaitCsv);

        let (record, effects) = apply(&record, SwapEvent::CsvPassed);
        assert_eq!(record.current, ClaimSwapCsv);
        assert!(effects.contains(&Effect::RequestBroadcast(Broadcast::ClaimCsv)));

        let (record, effects) = apply(
            &record,
            SwapEvent::ClaimBroadcasted {
                tx_id: "ef".repeat(32),
            },
        );
        assert_eq!(record.current, ClaimedCsv);
        assert!(effects.contains(&Effect::ReportSuspiciousPeer));

        // Late coop close after the csv claim.
        let coop = SwapEvent::Message(PeerMessage::CoopClose(messages::CoopClose {
            swap_id: record.id.clone(),
            message: "too late".to_string(),
        }));
        assert_eq!(transition(&record, &coop).unwrap(), None);
    }

    #[test]
    fn maker_cannot_cancel_after_broadcast() {
        let record = swap_in_sender_in(AwaitClaim);
        assert!(
            transition(
                &record,
                &SwapEvent::Cancel {
                    reason: "user".to_string()
                }
            )
            .is_err()
        );
    }

    #[test]
    fn second_opening_txid_is_rejected() {
        let mut record = swap_in_sender_in(BroadcastOpeningTx);
        record.opening_tx_id = Some("aa".repeat(32));
        let event = SwapEvent::OpeningBroadcasted(OpeningTx {
            tx_id: "bb".repeat(32),
            vout: 0,
            tx_hex: "00".to_string(),
            script_pubkey: "0014".to_string(),
            start_height: 100,
            csv: 1008,
        });
        assert!(transition(&record, &event).is_err());
    }

    #[test]
    fn resume_plan_fails_unfinished_payments() {
        let mut record = swap_out_sender();
        record.current = PayFeeInvoice;
        let plan = resume_plan(&record);
        assert!(plan.effects.is_empty());
        assert!(matches!(plan.event, Some(SwapEvent::ActionFailed { .. })));

        let (record, _) = apply(&record, plan.event.unwrap());
        assert_eq!(record.current, Canceled);

        let created = swap_out_sender();
        assert!(matches!(
            resume_plan(&created).event,
            Some(SwapEvent::Cancel { .. })
        ));
    }

    #[test]
    fn resume_plan_rearms_maker_watches() {
        let plan = resume_plan(&swap_in_sender_in(AwaitClaim));
        assert!(plan.event.is_none());
        assert!(matches!(plan.effects[0], Effect::WatchTimeout(_)));
        assert!(matches!(
            &plan.effects[1],
            Effect::Send { message: PeerMessage::OpeningTxBroadcasted(_), retry: true }
        ));

        assert!(resume_plan(&swap_in_sender_in(ClaimedCsv)).effects.is_empty());
    }

    #[test]
    fn graphs_start_created_and_end_terminal() {
        for (swap_type, role) in [
            (SwapType::SwapIn, SwapRole::Sender),
            (SwapType::SwapIn, SwapRole::Receiver),
            (SwapType::SwapOut, SwapRole::Sender),
            (SwapType::SwapOut, SwapRole::Receiver),
        ] {
            let graph = states(swap_type, role);
            assert_eq!(graph[0], Created);
            assert_eq!(graph.last(), Some(&Canceled));
        }
    }
}
