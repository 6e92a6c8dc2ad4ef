//! Seams towards the outside world: the byte-level [Transport] (a pub/sub
//! room) and the typed [MessageBus] the channel logic talks to.

mod encoding;
pub mod memory;

use core::fmt::Debug;

use tokio::sync::mpsc;

pub use encoding::{decode, encode, DecodeError, JsonEncodingLayer};

use crate::{
    ledger::LedgerCall, messages::ParticipantMessage, peers::PeerId, session::Notice,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not joined to a room")]
    NotJoined,
    #[error("peer {0} is not in the room")]
    UnknownPeer(PeerId),
    #[error("transport closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Events produced by the transport after joining a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Message { from: PeerId, data: Vec<u8> },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Low-level abstraction over the broadcast network (e.g. a pub/sub room).
///
/// Sending is fire-and-forget: an `Ok` only means the message was handed to
/// the network, not that it arrived.
pub trait Transport: Debug + Send + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Join a room. Peer presence and inbound messages arrive on the
    /// returned stream, in no guaranteed order and possibly duplicated.
    fn join(&mut self, room: &str) -> Result<TransportEvents, TransportError>;

    fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), TransportError>;

    fn broadcast(&self, data: Vec<u8>) -> Result<(), TransportError>;
}

/// Typed outbound side of the protocol.
///
/// The channel logic never performs I/O itself, it only emits messages,
/// ledger calls and notices through this trait.
pub trait MessageBus {
    fn send_to_participant(&mut self, peer: &PeerId, msg: ParticipantMessage);
    fn broadcast(&mut self, msg: ParticipantMessage);
    fn send_to_ledger(&mut self, call: LedgerCall);
    fn notify(&mut self, notice: Notice);
}

#[derive(Debug, Clone)]
pub enum Effect {
    Send {
        to: PeerId,
        msg: ParticipantMessage,
    },
    Broadcast(ParticipantMessage),
    Ledger(LedgerCall),
    Notify(Notice),
}

/// [MessageBus] that queues everything for the session to execute after the
/// current event has been processed.
#[derive(Debug, Default)]
pub struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Effect> {
        self.effects.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

impl MessageBus for Outbox {
    fn send_to_participant(&mut self, peer: &PeerId, msg: ParticipantMessage) {
        self.effects.push(Effect::Send {
            to: peer.clone(),
            msg,
        });
    }

    fn broadcast(&mut self, msg: ParticipantMessage) {
        self.effects.push(Effect::Broadcast(msg));
    }

    fn send_to_ledger(&mut self, call: LedgerCall) {
        self.effects.push(Effect::Ledger(call));
    }

    fn notify(&mut self, notice: Notice) {
        self.effects.push(Effect::Notify(notice));
    }
}
