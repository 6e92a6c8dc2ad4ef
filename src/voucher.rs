//! Vouchers: signed statements authorising the receiver to withdraw up to a
//! cumulative amount from a channel.
//!
//! The signed message is `keccak256(abi.encodePacked(channel, amount))`.
//! The settlement contract re-derives exactly these bytes in
//! `closeChannel`, so any change to field order, width or padding here
//! invalidates every voucher.

pub mod packed;

use serde::{Deserialize, Serialize};

use crate::{
    sig::{self, Signer},
    types::{Address, Hash, Signature, U256},
};

/// The canonical bytes of a voucher message (52 bytes).
pub fn encode(channel: Address, amount: U256) -> Vec<u8> {
    packed::to_bytes(&(channel, amount))
}

/// Hash of [encode()], before the personal-sign prefix is applied.
pub fn message_hash(channel: Address, amount: U256) -> Hash {
    packed::to_hash(&(channel, amount))
}

/// Sign a voucher message hash (personal-sign convention).
pub fn sign(message: Hash, signer: &Signer) -> Signature {
    signer.sign_eth(message)
}

/// Recover who signed `message`.
///
/// Only used for local sanity checks; the authoritative verification happens
/// on-chain when the channel is closed.
pub fn recover_signer(message: Hash, signature: Signature) -> Result<Address, sig::Error> {
    sig::recover_signer(message, signature)
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    pub channel_address: Address,
    pub amount: U256,
    pub signature: Signature,
}

impl Voucher {
    pub fn new(signer: &Signer, channel_address: Address, amount: U256) -> Self {
        let signature = sign(message_hash(channel_address, amount), signer);
        Voucher {
            channel_address,
            amount,
            signature,
        }
    }

    pub fn message_hash(&self) -> Hash {
        message_hash(self.channel_address, self.amount)
    }

    pub fn signer(&self) -> Result<Address, sig::Error> {
        recover_signer(self.message_hash(), self.signature)
    }

    /// Whether this voucher carries a valid signature by `address`.
    ///
    /// Structurally broken signatures are reported as errors, a valid
    /// signature by somebody else is `Ok(false)`.
    pub fn is_signed_by(&self, address: Address) -> Result<bool, sig::Error> {
        Ok(self.signer()? == address)
    }
}
