//! The single payment channel of a session and its lifecycle.
//!
//! ```text
//! Idle ──create──▶ AwaitingOpenConfirmation ──confirmed──▶ Open(Sender)
//!  │                                                        │    │
//!  └──── ChannelCreate received ──▶ Open(Receiver)    claimTimeout │
//!                                      │                    ▼    │
//!                                  closeChannel       Closing(Sender)
//!                                      ▼                    │
//!                               Closing(Receiver)           ▼
//!                                      │                 Expired
//!                                      ▼
//!                                    Closed
//! ```
//!
//! `Closed`, `Expired` and `Idle` all allow a new channel to be created.
//! A `ChannelClose` from the counterparty resets an open channel to `Idle`.

mod machine;
#[cfg(test)]
mod tests;

use core::fmt;

use crate::{
    ledger::LedgerOperation,
    peers::PeerId,
    sig,
    types::{Address, U256},
    voucher::Voucher,
};

pub use machine::ChannelMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Escrows the funds and signs vouchers.
    Sender,
    /// Collects vouchers and settles.
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingOpenConfirmation,
    Open(Role),
    /// A settling ledger call (close or timeout claim) is in flight.
    Closing(Role),
    Closed,
    Expired,
}

impl Phase {
    /// Whether a new channel may be created or accepted.
    pub fn is_vacant(self) -> bool {
        matches!(self, Phase::Idle | Phase::Closed | Phase::Expired)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("idle"),
            Phase::AwaitingOpenConfirmation => f.write_str("awaiting open confirmation"),
            Phase::Open(role) => write!(f, "open ({role:?})"),
            Phase::Closing(role) => write!(f, "closing ({role:?})"),
            Phase::Closed => f.write_str("closed"),
            Phase::Expired => f.write_str("expired"),
        }
    }
}

/// The active channel as known locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Unset until the ledger confirms the escrow.
    pub address: Option<Address>,
    pub counterparty: PeerId,
    pub counterparty_address: Address,
    pub role: Role,
    /// Escrowed amount.
    pub balance: U256,
    /// Absolute ledger time.
    pub expiration: Option<u64>,
    /// Accepted (or, for the sender, signed) vouchers in non-decreasing
    /// amount order.
    pub vouchers: Vec<Voucher>,
}

impl Channel {
    /// The voucher with the highest amount, the only one worth settling.
    pub fn latest_voucher(&self) -> Option<&Voucher> {
        self.vouchers.last()
    }

    /// Highest amount authorized so far, zero without vouchers.
    pub fn authorized(&self) -> U256 {
        self.latest_voucher().map(|v| v.amount).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("{operation} is not allowed while {phase}")]
    IllegalPhase {
        operation: &'static str,
        phase: Phase,
    },
    #[error("amount {requested} is below the last signed amount {last}")]
    NonMonotonic { last: U256, requested: U256 },
    #[error("no voucher to settle with")]
    NoVoucher,
    #[error("voucher signed by {actual}, expected {expected}")]
    WrongSigner { expected: Address, actual: Address },
    #[error("new expiration {requested} is not after {current}")]
    ExpirationNotLater { current: u64, requested: u64 },
    #[error("channel expires at {expiration}, ledger time is {now}")]
    NotExpired { now: u64, expiration: u64 },
    #[error("a {0} call is already in flight")]
    CallInFlight(LedgerOperation),
    #[error("voucher is for channel {actual}, active channel is {expected}")]
    ChannelMismatch { expected: Address, actual: Address },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),
    #[error(transparent)]
    InvalidSignature(#[from] sig::Error),
}
