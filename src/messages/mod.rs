pub mod codec;

use serde::{Deserialize, Serialize};

use crate::swap::{Asset, ClaimType, SwapId};

pub use codec::{decode, encode};

/// First custom message type used by the swap protocol. Every kind adds an
/// even offset so the wire type stays odd, which lets uninterested peers
/// ignore the message (BOLT #1 "it's ok to be odd").
pub const BASE_MESSAGE_TYPE: u16 = 42069;

/// Exclusive upper bound of the swap message range.
pub const UPPER_MESSAGE_BOUND: u16 = BASE_MESSAGE_TYPE + 2 * MessageType::ALL.len() as u16;

/// Version of the peer protocol spoken by this crate.
pub const PROTOCOL_VERSION: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("even message type {0} is not accepted")]
    EvenMessageType(u16),
    #[error("message type {0} is not in the swap message range")]
    NotInRange(u16),
    #[error("invalid message type hex string {0:?}")]
    InvalidHex(String),
    #[error("decode {kind:?} payload")]
    Decode {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode {kind:?} payload")]
    Encode {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    SwapInRequest,
    SwapOutRequest,
    SwapInAgreement,
    SwapOutAgreement,
    OpeningTxBroadcasted,
    Canceled,
    CoopClose,
    Poll,
    RequestPoll,
    Claimed,
}

impl MessageType {
    /// Registry of every kind in wire order. The numeric type of a kind is
    /// derived from its position here and must never be reordered.
    pub const ALL: [MessageType; 10] = [
        MessageType::SwapInRequest,
        MessageType::SwapOutRequest,
        MessageType::SwapInAgreement,
        MessageType::SwapOutAgreement,
        MessageType::OpeningTxBroadcasted,
        MessageType::Canceled,
        MessageType::CoopClose,
        MessageType::Poll,
        MessageType::RequestPoll,
        MessageType::Claimed,
    ];

    pub fn code(self) -> u16 {
        let index = Self::ALL
            .iter()
            .position(|t| *t == self)
            .unwrap_or_default() as u16;
        BASE_MESSAGE_TYPE + 2 * index
    }

    pub fn from_code(code: u16) -> Result<Self, MessageError> {
        if !in_range(code)? {
            return Err(MessageError::NotInRange(code));
        }
        let index = usize::from((code - BASE_MESSAGE_TYPE) / 2);
        Ok(Self::ALL[index])
    }

    /// Hex form used by host nodes when reporting custom message types.
    pub fn to_hex_string(self) -> String {
        format!("{:x}", self.code())
    }

    pub fn from_hex_str(s: &str) -> Result<Self, MessageError> {
        let code = u16::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| MessageError::InvalidHex(s.to_string()))?;
        Self::from_code(code)
    }
}

/// Reports whether `code` lies in the swap message range. Even types are an
/// error rather than `false`: an even custom message must never be ignored
/// silently.
pub fn in_range(code: u16) -> Result<bool, MessageError> {
    if code % 2 == 0 {
        return Err(MessageError::EvenMessageType(code));
    }
    Ok((BASE_MESSAGE_TYPE..UPPER_MESSAGE_BOUND).contains(&code))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInRequest {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    pub asset: Asset,
    pub channel_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOutRequest {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    pub asset: Asset,
    pub channel_id: String,
    pub amount: u64,
    pub taker_pubkey_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInAgreement {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    pub taker_pubkey_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOutAgreement {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    pub maker_pubkey_hash: String,
    pub fee_invoice: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningTxBroadcasted {
    pub swap_id: SwapId,
    pub maker_pubkey_hash: String,
    pub invoice: String,
    pub tx_id: String,
    pub vout: u32,
    /// Hex encoded scriptPubKey of the swap output.
    pub script_pubkey: String,
    /// Relative timeout in blocks after which the maker may reclaim.
    pub csv: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claimed {
    pub swap_id: SwapId,
    pub claim_type: ClaimType,
    pub claim_tx_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canceled {
    pub swap_id: SwapId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoopClose {
    pub swap_id: SwapId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub version: u64,
    pub supported_assets: Vec<String>,
    pub peer_allowed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPoll {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    SwapInRequest(SwapInRequest),
    SwapOutRequest(SwapOutRequest),
    SwapInAgreement(SwapInAgreement),
    SwapOutAgreement(SwapOutAgreement),
    OpeningTxBroadcasted(OpeningTxBroadcasted),
    Canceled(Canceled),
    CoopClose(CoopClose),
    Poll(Poll),
    RequestPoll(RequestPoll),
    Claimed(Claimed),
}

impl PeerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::SwapInRequest(_) => MessageType::SwapInRequest,
            PeerMessage::SwapOutRequest(_) => MessageType::SwapOutRequest,
            PeerMessage::SwapInAgreement(_) => MessageType::SwapInAgreement,
            PeerMessage::SwapOutAgreement(_) => MessageType::SwapOutAgreement,
            PeerMessage::OpeningTxBroadcasted(_) => MessageType::OpeningTxBroadcasted,
            PeerMessage::Canceled(_) => MessageType::Canceled,
            PeerMessage::CoopClose(_) => MessageType::CoopClose,
            PeerMessage::Poll(_) => MessageType::Poll,
            PeerMessage::RequestPoll(_) => MessageType::RequestPoll,
            PeerMessage::Claimed(_) => MessageType::Claimed,
        }
    }

    /// Swap the message belongs to; `None` for node-level messages.
    pub fn swap_id(&self) -> Option<&SwapId> {
        match self {
            PeerMessage::SwapInRequest(m) => Some(&m.swap_id),
            PeerMessage::SwapOutRequest(m) => Some(&m.swap_id),
            PeerMessage::SwapInAgreement(m) => Some(&m.swap_id),
            PeerMessage::SwapOutAgreement(m) => Some(&m.swap_id),
            PeerMessage::OpeningTxBroadcasted(m) => Some(&m.swap_id),
            PeerMessage::Canceled(m) => Some(&m.swap_id),
            PeerMessage::CoopClose(m) => Some(&m.swap_id),
            PeerMessage::Claimed(m) => Some(&m.swap_id),
            PeerMessage::Poll(_) | PeerMessage::RequestPoll(_) => None,
        }
    }
}
