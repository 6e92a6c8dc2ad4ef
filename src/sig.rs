//! Handles the creation and verification of (Ethereum) Signatures.
//!
//! Vouchers are signed with the "personal sign" convention, so the same
//! recovery path works off-chain and inside the settlement contract.

use crate::types::{Address, Hash, Signature};
use sha3::{Digest, Keccak256};

#[cfg(not(any(feature = "k256", feature = "secp256k1")))]
compile_error!("enable at least one signing backend: `k256` or `secp256k1`");

#[cfg(feature = "k256")]
mod k256;
#[cfg(feature = "secp256k1")]
mod secp256k1;

// secp256k1 (libsecp256k1 bindings) wins if both are selected.
#[cfg(feature = "secp256k1")]
pub use self::secp256k1::{recover_signer, Signer};
#[cfg(all(feature = "k256", not(feature = "secp256k1")))]
pub use self::k256::{recover_signer, Signer};


/// Structural problems with signature bytes or key material.
///
/// A signature that is well-formed but recovers to an unexpected address is
/// *not* an error at this level; callers compare the recovered address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),
    #[error("invalid secret key")]
    InvalidKey,
}

/// Add the `\x19Ethereum Signed Message:\n32` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
pub fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding of (string, bytes32)
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Derive the Ethereum address from an uncompressed SEC1 public key (65
/// bytes, leading `0x04`).
fn address_from_uncompressed(pk_bytes: &[u8; 65]) -> Address {
    // See https://ethereum.stackexchange.com/questions/65233/goethereum-getting-public-key-from-private-key-hex-formatting
    //
    // Throw away the first byte, which is not part of the public key. It is
    // added due to the encoding used.
    let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

/// Normalise the recovery byte to `0`/`1`.
///
/// Signatures produced here carry `27 + parity` (the EVM convention), but
/// some wallets emit the raw parity bit; both are accepted.
fn recovery_parity(sig: &Signature) -> Result<u8, Error> {
    match sig.v() {
        v @ (0 | 1) => Ok(v),
        v @ (27 | 28) => Ok(v - 27),
        _ => Err(Error::InvalidSignature("recovery id out of range")),
    }
}

/// Reject the upper half of the curve order for `s`.
///
/// [EIP-2](https://eips.ethereum.org/EIPS/eip-2) makes these malleable
/// signatures invalid and OpenZeppelin's ECDSA.sol refuses them, so they
/// would fail on-chain anyway.
fn check_low_s(sig: &Signature) -> Result<(), Error> {
    // secp256k1 n/2
    const HALF_ORDER: [u8; 32] = [
        0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b,
        0x20, 0xa0,
    ];
    if sig.0[32..64] > HALF_ORDER[..] {
        Err(Error::InvalidSignature("s is not canonical"))
    } else {
        Ok(())
    }
}
