use crate::{
    messages::{Introduction, ParticipantMessage},
    peers::PeerId,
    sig::Signer,
    types::Address,
    wire::MessageBus,
};

/// The local participant: its transport identity and the key it signs
/// vouchers with.
///
/// An application usually has exactly one of these per session.
#[derive(Debug)]
pub struct Client {
    pub(crate) signer: Signer,
    pub(crate) peer_id: PeerId,
}

impl Client {
    pub fn new(signer: Signer, peer_id: PeerId) -> Self {
        Client { signer, peer_id }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// On-chain address, derived from the signing key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn introduction(&self) -> ParticipantMessage {
        ParticipantMessage::Introduction(Introduction {
            id: self.peer_id.clone(),
            address: self.address(),
            online: true,
        })
    }

    /// Handshake towards a peer that just appeared in the room.
    pub fn send_introduction<B: MessageBus>(&self, bus: &mut B, to: &PeerId) {
        bus.send_to_participant(to, self.introduction());
    }

    /// Announce ourselves to everybody currently in the room.
    pub fn broadcast_introduction<B: MessageBus>(&self, bus: &mut B) {
        bus.broadcast(self.introduction());
    }
}
