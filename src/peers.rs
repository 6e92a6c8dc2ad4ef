//! Presence tracking for the peers of one room.
//!
//! Records are created by the first introduction of a peer and never
//! removed; leaving only flips `online`. The registry is driven exclusively
//! by the session actor, everything else gets read-only access.

use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Address;

/// Opaque transport-level identifier of a participant.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub chain_address: Address,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown peer: {0}")]
pub struct UnknownPeer(pub PeerId);

/// What an introduction changed, mostly interesting for logging and
/// notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Introduced {
    New,
    CameOnline,
    AlreadyOnline,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerRecord>,
    selected: Option<PeerId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert driven by an introduction message.
    ///
    /// The chain address of a known peer is never changed.
    pub fn on_introduction(&mut self, peer_id: &PeerId, chain_address: Address) -> Introduced {
        if let Some(record) = self.peers.get_mut(peer_id) {
            if record.chain_address != chain_address {
                tracing::warn!(
                    peer = %peer_id,
                    known = %record.chain_address,
                    announced = %chain_address,
                    "peer re-introduced with a different address, keeping the original"
                );
            }
            return if record.online {
                Introduced::AlreadyOnline
            } else {
                record.online = true;
                Introduced::CameOnline
            };
        }

        self.peers.insert(
            peer_id.clone(),
            PeerRecord {
                peer_id: peer_id.clone(),
                chain_address,
                online: true,
            },
        );
        if self.peers.len() == 1 {
            self.select_default_peer();
        }
        Introduced::New
    }

    /// Mark a peer offline. Unknown peers are ignored.
    ///
    /// Returns whether a record changed.
    pub fn on_peer_left(&mut self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record) if record.online => {
                record.online = false;
                true
            }
            Some(_) => false,
            None => {
                tracing::debug!(peer = %peer_id, "leave from a peer that never introduced itself");
                false
            }
        }
    }

    /// Selects the only known peer, if there is exactly one and nothing is
    /// selected yet.
    pub fn select_default_peer(&mut self) -> Option<&PeerId> {
        if self.selected.is_none() && self.peers.len() == 1 {
            self.selected = self.peers.keys().next().cloned();
        }
        self.selected.as_ref()
    }

    pub fn select(&mut self, peer_id: &PeerId) -> Result<(), UnknownPeer> {
        if !self.peers.contains_key(peer_id) {
            return Err(UnknownPeer(peer_id.clone()));
        }
        self.selected = Some(peer_id.clone());
        Ok(())
    }

    pub fn selected(&self) -> Option<&PeerRecord> {
        self.selected.as_ref().and_then(|id| self.peers.get(id))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// All known peers, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn online(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values().filter(|p| p.online)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
