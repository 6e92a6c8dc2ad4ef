//! Requests to and replies from the settlement ledger.
//!
//! The channel logic only ever produces [LedgerCall]s and consumes
//! [LedgerReply]s; [gateway::LedgerGateway] turns the former into calls on a
//! [Ledger] implementation and reports their results back asynchronously.

pub mod gateway;
pub mod simulated;

use core::fmt;

use async_trait::async_trait;

use crate::types::{Address, Signature, U256};

pub use gateway::LedgerGateway;
pub use simulated::{EscrowChannel, LedgerAccount, SimulatedLedger};

/// Correlates a ledger call with its eventual reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOperation {
    OpenChannel,
    ExtendExpiration,
    CloseChannel,
    ClaimTimeout,
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LedgerOperation::OpenChannel => "openChannel",
            LedgerOperation::ExtendExpiration => "extendExpiration",
            LedgerOperation::CloseChannel => "closeChannel",
            LedgerOperation::ClaimTimeout => "claimTimeout",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRequest {
    OpenChannel {
        receiver: Address,
        expiry_secs: u64,
        amount: U256,
    },
    ExtendExpiration {
        channel: Address,
        new_expiry: u64,
    },
    CloseChannel {
        channel: Address,
        amount: U256,
        signature: Signature,
    },
    ClaimTimeout {
        channel: Address,
    },
}

impl LedgerRequest {
    pub fn operation(&self) -> LedgerOperation {
        match self {
            LedgerRequest::OpenChannel { .. } => LedgerOperation::OpenChannel,
            LedgerRequest::ExtendExpiration { .. } => LedgerOperation::ExtendExpiration,
            LedgerRequest::CloseChannel { .. } => LedgerOperation::CloseChannel,
            LedgerRequest::ClaimTimeout { .. } => LedgerOperation::ClaimTimeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    pub id: RequestId,
    pub request: LedgerRequest,
}

/// Result of a confirmed `openChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedChannel {
    pub address: Address,
    /// Absolute ledger time (seconds).
    pub expiration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Opened(OpenedChannel),
    ExpirationExtended(u64),
    Closed,
    TimeoutClaimed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReply {
    pub id: RequestId,
    pub operation: LedgerOperation,
    pub result: Result<LedgerOutcome, LedgerError>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// A contract precondition failed.
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: U256, required: U256 },
    #[error("no channel at {0}")]
    UnknownChannel(Address),
    /// The ledger could not be reached or did not answer.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// The settlement ledger as seen by one account.
///
/// Every call is a remote, fallible operation with on-chain latency; the
/// account the handle is bound to is the implicit caller.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    fn account(&self) -> Address;

    async fn open_channel(
        &self,
        receiver: Address,
        expiry_secs: u64,
        amount: U256,
    ) -> Result<OpenedChannel, LedgerError>;

    /// Returns the new expiration.
    async fn extend_expiration(&self, channel: Address, new_expiry: u64)
        -> Result<u64, LedgerError>;

    async fn close_channel(
        &self,
        channel: Address,
        amount: U256,
        signature: Signature,
    ) -> Result<(), LedgerError>;

    async fn claim_timeout(&self, channel: Address) -> Result<(), LedgerError>;

    async fn balance(&self, address: Address) -> Result<U256, LedgerError>;

    /// Current ledger time in seconds.
    async fn now(&self) -> Result<u64, LedgerError>;
}

/// Run a single request against `ledger`.
pub async fn execute<L: Ledger + ?Sized>(
    ledger: &L,
    request: LedgerRequest,
) -> Result<LedgerOutcome, LedgerError> {
    match request {
        LedgerRequest::OpenChannel {
            receiver,
            expiry_secs,
            amount,
        } => ledger
            .open_channel(receiver, expiry_secs, amount)
            .await
            .map(LedgerOutcome::Opened),
        LedgerRequest::ExtendExpiration {
            channel,
            new_expiry,
        } => ledger
            .extend_expiration(channel, new_expiry)
            .await
            .map(LedgerOutcome::ExpirationExtended),
        LedgerRequest::CloseChannel {
            channel,
            amount,
            signature,
        } => ledger
            .close_channel(channel, amount, signature)
            .await
            .map(|()| LedgerOutcome::Closed),
        LedgerRequest::ClaimTimeout { channel } => ledger
            .claim_timeout(channel)
            .await
            .map(|()| LedgerOutcome::TimeoutClaimed),
    }
}
