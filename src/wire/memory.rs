//! In-process pub/sub rooms, used by the tests and the demo in place of a
//! real network.
//!
//! Semantics follow a typical pub/sub room: joining announces the new
//! member to everybody already present and vice versa, a broadcast is
//! delivered to every member including the sender, and dropping a transport
//! leaves the room.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportEvent, TransportEvents};
use crate::peers::PeerId;

type Members = BTreeMap<PeerId, mpsc::UnboundedSender<TransportEvent>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    rooms: Arc<Mutex<HashMap<String, Members>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint for `peer` on this network. It is not part of any
    /// room until [Transport::join] is called.
    pub fn transport(&self, peer: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: PeerId::new(peer),
            room: None,
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Members>> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current members of a room.
    pub fn members(&self, room: &str) -> Vec<PeerId> {
        self.rooms()
            .get(room)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
    room: Option<String>,
}

impl MemoryTransport {
    /// Leave the current room, announcing it to the remaining members.
    pub fn leave(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        let mut rooms = self.network.rooms();
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&self.local);
            for tx in members.values() {
                let _ = tx.send(TransportEvent::PeerLeft(self.local.clone()));
            }
        }
    }

    fn with_members<R>(
        &self,
        f: impl FnOnce(&Members) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let room = self.room.as_ref().ok_or(TransportError::NotJoined)?;
        let rooms = self.network.rooms();
        let members = rooms.get(room).ok_or(TransportError::NotJoined)?;
        f(members)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.leave();
    }
}

impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local.clone()
    }

    fn join(&mut self, room: &str) -> Result<TransportEvents, TransportError> {
        self.leave();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.network.rooms();
        let members = rooms.entry(room.to_owned()).or_default();
        for (peer, other) in members.iter() {
            let _ = other.send(TransportEvent::PeerJoined(self.local.clone()));
            let _ = tx.send(TransportEvent::PeerJoined(peer.clone()));
        }
        members.insert(self.local.clone(), tx);
        drop(rooms);

        self.room = Some(room.to_owned());
        tracing::debug!(peer = %self.local, room, "joined room");
        Ok(rx)
    }

    fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        self.with_members(|members| {
            let tx = members
                .get(peer)
                .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
            tx.send(TransportEvent::Message {
                from: self.local.clone(),
                data,
            })
            .map_err(|_| TransportError::Closed)
        })
    }

    fn broadcast(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.with_members(|members| {
            for tx in members.values() {
                // A member whose receiver is gone is about to leave anyway.
                let _ = tx.send(TransportEvent::Message {
                    from: self.local.clone(),
                    data: data.clone(),
                });
            }
            Ok(())
        })
    }
}
