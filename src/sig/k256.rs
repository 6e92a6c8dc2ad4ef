//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};

use super::{
    address_from_uncompressed, check_low_s, hash_to_eth_signed_msg_hash, recovery_parity, Error,
};

pub struct Signer {
    key: SigningKey,
    addr: Address,
}

// Never print key material.
impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl From<&VerifyingKey> for Address {
    fn from(key: &VerifyingKey) -> Self {
        // The uncompressed encoding is always 65 bytes (0x04 || x || y).
        let point = key.to_encoded_point(false);
        let mut pk_bytes = [0u8; 65];
        pk_bytes.copy_from_slice(point.as_bytes());
        address_from_uncompressed(&pk_bytes)
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        Self::from_key(SigningKey::random(rng))
    }

    /// Import a raw 32-byte secp256k1 secret key.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(secret).map_err(|_| Error::InvalidKey)?;
        Ok(Self::from_key(key))
    }

    fn from_key(key: SigningKey) -> Self {
        let addr = Address::from(&key.verifying_key());
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self
            .key
            .sign_prehash(&hash.0)
            .expect("signing a 32 byte prehash is infallible");

        // Luckily for us, this Signature type already has the format we need:
        // - 65 bytes containing r, s and v in this order
        //
        // But we still have to add 27 to v for the signature to be valid in the
        // EVM.
        let mut sig_bytes = [0u8; 65];
        sig_bytes.copy_from_slice(sig.as_bytes());
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }
}

/// Recover the signer's address from a prefixed-hash signature.
///
/// `msg` is the hash given to [Signer::sign_eth()], without the
/// `Ethereum Signed Message` prefix.
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
    let parity = recovery_parity(&eth_sig)?;
    check_low_s(&eth_sig)?;

    // "\x19Ethereum Signed Message:\n32" format
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Back to the format expected by k256 (raw parity bit)
    let mut sig_bytes: [u8; 65] = eth_sig.0;
    sig_bytes[64] = parity;

    let sig = recoverable::Signature::from_bytes(&sig_bytes)
        .map_err(|_| Error::InvalidSignature("r or s out of range"))?;

    let verifying_key = sig
        .recover_verifying_key_from_digest_bytes(&hash.0.into())
        .map_err(|_| Error::InvalidSignature("no public key recoverable"))?;
    Ok(Address::from(&verifying_key))
}
