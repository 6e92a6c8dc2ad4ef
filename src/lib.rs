//! Unidirectional payment channels between two peers of a pub/sub room.
//!
//! The sender escrows funds on a settlement ledger and hands out signed
//! vouchers over growing cumulative amounts; the receiver settles with the
//! latest one, or the sender reclaims everything after expiration.
//!
//! Start with [Session::spawn] and drive it through the returned
//! [SessionHandle].

pub mod types;
pub mod sig;
pub mod voucher;

pub mod channel;
mod client;
pub mod config;
mod error;
pub mod ledger;
pub mod messages;
pub mod peers;
pub mod session;
pub mod wire;

pub use client::Client;
pub use config::SessionConfig;
pub use error::Error;
pub use session::{Notice, Session, SessionHandle, Snapshot};
pub use types::{Address, Hash, Signature, U256};
pub use voucher::Voucher;
