use serde_json::Value;

use super::{Transport, TransportError};
use crate::{
    messages::{classify, Introduction, MessageKind, ParticipantMessage, EVENT_TYPE},
    peers::PeerId,
};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("payload is not a recognized message")]
    Unrecognized,
    #[error("malformed {kind:?} message: {source}")]
    Malformed {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode(msg: &ParticipantMessage) -> Result<Vec<u8>, TransportError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Parse and classify an inbound payload.
pub fn decode(data: &[u8]) -> Result<ParticipantMessage, DecodeError> {
    let value: Value = serde_json::from_slice(data).map_err(DecodeError::Json)?;
    let kind = classify(&value);
    let malformed = |source: serde_json::Error| DecodeError::Malformed { kind, source };

    match kind {
        MessageKind::Unrecognized => Err(DecodeError::Unrecognized),
        MessageKind::Introduction if value.get(EVENT_TYPE).is_none() => {
            // Legacy introduction without a tag.
            let intro: Introduction = serde_json::from_value(value).map_err(malformed)?;
            Ok(ParticipantMessage::Introduction(intro))
        }
        _ => serde_json::from_value(value).map_err(malformed),
    }
}

/// Puts JSON-encoded [ParticipantMessage]s on a byte [Transport].
#[derive(Debug)]
pub struct JsonEncodingLayer<T: Transport> {
    transport: T,
}

impl<T: Transport> JsonEncodingLayer<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn send_to_participant(
        &self,
        peer: &PeerId,
        msg: &ParticipantMessage,
    ) -> Result<(), TransportError> {
        self.transport.send(peer, encode(msg)?)
    }

    pub fn broadcast(&self, msg: &ParticipantMessage) -> Result<(), TransportError> {
        self.transport.broadcast(encode(msg)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{ChannelClose, ChannelCreate},
        types::{Address, U256},
    };

    #[test]
    fn roundtrip_through_bytes() {
        let msg = ParticipantMessage::ChannelCreate(ChannelCreate {
            channel_address: Address([9; 20]),
            channel_balance: U256::from(10),
            expiration: Some(1_700_000_060),
        });
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn legacy_introduction_is_decoded() {
        let data = br#"{"id":"QmBob","address":"0x0202020202020202020202020202020202020202","online":true}"#;
        match decode(data).unwrap() {
            ParticipantMessage::Introduction(intro) => {
                assert_eq!(intro.id, PeerId::from("QmBob"));
                assert_eq!(intro.address, Address([2; 20]));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn malformed_protocol_message_is_not_an_introduction() {
        // Close without a channel address.
        let err = decode(br#"{"eventType":"CLOSE","id":"x","address":"0x00","online":true}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Malformed {
                kind: MessageKind::ChannelClose,
                ..
            }
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode(b"Hello QmBob!"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode(br#"{"hello":"world"}"#),
            Err(DecodeError::Unrecognized)
        ));
        assert!(matches!(
            decode(br#"{"eventType":"SIGN","channelAddress":"0x00","amount":"1"}"#),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn close_roundtrip() {
        let msg = ParticipantMessage::ChannelClose(ChannelClose {
            channel_address: Address([3; 20]),
        });
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }
}
