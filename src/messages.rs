//! Application messages exchanged between the participants of a room.
//!
//! Every message carries an explicit `eventType` discriminant. Older peers
//! sent introductions without one; [classify()] still recognises those by
//! their exact key set, but never guesses for anything else.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    peers::PeerId,
    types::{Address, U256},
    voucher::Voucher,
};

pub const EVENT_TYPE: &str = "eventType";

/// Handshake payload sent to every peer we see joining the room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub id: PeerId,
    pub address: Address,
    pub online: bool,
}

/// Sent by the sender once the escrow is confirmed on the ledger.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreate {
    pub channel_address: Address,
    pub channel_balance: U256,
    /// Absolute ledger time after which the sender can reclaim the escrow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelClose {
    pub channel_address: Address,
}

/// Messages sent between participants of a room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "eventType")]
pub enum ParticipantMessage {
    #[serde(rename = "INTRODUCE")]
    Introduction(Introduction),
    #[serde(rename = "CREATE")]
    ChannelCreate(ChannelCreate),
    #[serde(rename = "SIGN")]
    Voucher(Voucher),
    #[serde(rename = "CLOSE")]
    ChannelClose(ChannelClose),
}

impl ParticipantMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ParticipantMessage::Introduction(_) => MessageKind::Introduction,
            ParticipantMessage::ChannelCreate(_) => MessageKind::ChannelCreate,
            ParticipantMessage::Voucher(_) => MessageKind::Voucher,
            ParticipantMessage::ChannelClose(_) => MessageKind::ChannelClose,
        }
    }

    /// The channel a protocol message refers to (introductions refer to
    /// none).
    pub fn channel_address(&self) -> Option<Address> {
        match self {
            ParticipantMessage::Introduction(_) => None,
            ParticipantMessage::ChannelCreate(m) => Some(m.channel_address),
            ParticipantMessage::Voucher(v) => Some(v.channel_address),
            ParticipantMessage::ChannelClose(m) => Some(m.channel_address),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Introduction,
    ChannelCreate,
    Voucher,
    ChannelClose,
    Unrecognized,
}

impl MessageKind {
    fn from_event_type(tag: &str) -> Self {
        match tag {
            "INTRODUCE" => MessageKind::Introduction,
            "CREATE" => MessageKind::ChannelCreate,
            "SIGN" => MessageKind::Voucher,
            "CLOSE" => MessageKind::ChannelClose,
            _ => MessageKind::Unrecognized,
        }
    }
}

/// Tag-less introduction as sent by peers predating `eventType`.
fn is_legacy_introduction(obj: &Map<String, Value>) -> bool {
    const KEYS: [&str; 3] = ["address", "id", "online"];
    obj.len() == KEYS.len() && KEYS.iter().all(|k| obj.contains_key(*k))
}

/// Decide what a payload claims to be, by tag first and key set second.
///
/// This only looks at the shape; whether the fields are well-formed is
/// checked when decoding.
pub fn classify(payload: &Value) -> MessageKind {
    let Some(obj) = payload.as_object() else {
        return MessageKind::Unrecognized;
    };
    match obj.get(EVENT_TYPE) {
        Some(Value::String(tag)) => MessageKind::from_event_type(tag),
        Some(_) => MessageKind::Unrecognized,
        None if is_legacy_introduction(obj) => MessageKind::Introduction,
        None => MessageKind::Unrecognized,
    }
}
