use crate::{
    channel::ChannelError,
    config::ConfigError,
    ledger::LedgerError,
    peers::UnknownPeer,
    sig,
    wire::{DecodeError, TransportError},
};

/// Everything a [crate::SessionHandle] call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    UnknownPeer(#[from] UnknownPeer),
    #[error("no peer selected")]
    NoPeerSelected,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session is not running")]
    SessionClosed,
}

impl From<sig::Error> for Error {
    fn from(e: sig::Error) -> Self {
        Error::Channel(ChannelError::InvalidSignature(e))
    }
}

impl Error {
    /// Whether this is a protocol violation (illegal phase, non-monotonic
    /// amount and the like) as opposed to an infrastructure failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::ProtocolViolation(_)))
    }
}
