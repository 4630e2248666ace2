use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{MessageError, MessageType, PeerMessage};

/// Serializes `message` into its JSON payload together with the wire type.
pub fn encode(message: &PeerMessage) -> Result<(MessageType, Vec<u8>), MessageError> {
    let kind = message.message_type();
    let payload = match message {
        PeerMessage::SwapInRequest(m) => to_payload(kind, m),
        PeerMessage::SwapOutRequest(m) => to_payload(kind, m),
        PeerMessage::SwapInAgreement(m) => to_payload(kind, m),
        PeerMessage::SwapOutAgreement(m) => to_payload(kind, m),
        PeerMessage::OpeningTxBroadcasted(m) => to_payload(kind, m),
        PeerMessage::Canceled(m) => to_payload(kind, m),
        PeerMessage::CoopClose(m) => to_payload(kind, m),
        PeerMessage::Poll(m) => to_payload(kind, m),
        PeerMessage::RequestPoll(m) => to_payload(kind, m),
        PeerMessage::Claimed(m) => to_payload(kind, m),
    }?;
    Ok((kind, payload))
}

/// Decodes a payload received under the numeric wire type `code`.
pub fn decode(code: u16, payload: &[u8]) -> Result<PeerMessage, MessageError> {
    let kind = MessageType::from_code(code)?;
    let message = match kind {
        MessageType::SwapInRequest => PeerMessage::SwapInRequest(from_payload(kind, payload)?),
        MessageType::SwapOutRequest => PeerMessage::SwapOutRequest(from_payload(kind, payload)?),
        MessageType::SwapInAgreement => PeerMessage::SwapInAgreement(from_payload(kind, payload)?),
        MessageType::SwapOutAgreement => {
            PeerMessage::SwapOutAgreement(from_payload(kind, payload)?)
        }
        MessageType::OpeningTxBroadcasted => {
            PeerMessage::OpeningTxBroadcasted(from_payload(kind, payload)?)
        }
        MessageType::Canceled => PeerMessage::Canceled(from_payload(kind, payload)?),
        MessageType::CoopClose => PeerMessage::CoopClose(from_payload(kind, payload)?),
        MessageType::Poll => PeerMessage::Poll(from_payload(kind, payload)?),
        MessageType::RequestPoll => PeerMessage::RequestPoll(from_payload(kind, payload)?),
        MessageType::Claimed => PeerMessage::Claimed(from_payload(kind, payload)?),
    };
    Ok(message)
}

fn to_payload<T: Serialize>(kind: MessageType, value: &T) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(value).map_err(|source| MessageError::Encode { kind, source })
}

fn from_payload<T: DeserializeOwned>(kind: MessageType, payload: &[u8]) -> Result<T, MessageError> {
    serde_json::from_slice(payload).map_err(|source| MessageError::Decode { kind, source })
}
