//! Signer using the secp256k1 crate (bindings to libsecp256k1).

use crate::types::{Address, Hash, Signature};
use secp256k1::{
    self,
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};

use super::{
    address_from_uncompressed, check_low_s, hash_to_eth_signed_msg_hash, recovery_parity, Error,
};

pub struct Signer {
    secp: Secp256k1<All>,
    sk: SecretKey,
    addr: Address,
}

// Never print key material.
impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl From<PublicKey> for Address {
    fn from(pk: PublicKey) -> Self {
        address_from_uncompressed(&pk.serialize_uncompressed())
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        Self::from_key(SecretKey::new(rng))
    }

    /// Import a raw 32-byte secp256k1 secret key.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, Error> {
        let sk = SecretKey::from_slice(secret).map_err(|_| Error::InvalidKey)?;
        Ok(Self::from_key(sk))
    }

    fn from_key(sk: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let addr = PublicKey::from_secret_key(&secp, &sk).into();
        Self { secp, sk, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Sign a hash using a Ethereum 65-byte recoverable signature.
    ///
    /// Note that this differs from transaction signatures, as it does not
    /// include the chain id.
    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // We have to use sign_ecdsa_recoverable because the smart contract must be
        // able to recover the address. This gives us the additional information
        // needed for v.
        let sig = self
            .secp
            .sign_ecdsa_recoverable(&Message::from(hash), &self.sk);
        let (v, rs) = sig.serialize_compact();

        // libsecp256k1 produces canonical (low-s) signatures, which is what
        // OpenZeppelin ECDSA.sol requires.
        debug_assert!(rs[32] & 0x80 == 0);

        // yParity is offset by 27 in the EVM (see EIP-2098 for the history).
        let v: u8 = 27 + v.to_i32() as u8;

        Signature::new(&rs, v)
    }
}

/// Recover the signer's address from a prefixed-hash signature.
///
/// `msg` is the hash given to [Signer::sign_eth()], without the
/// `Ethereum Signed Message` prefix.
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
    let parity = recovery_parity(&eth_sig)?;
    check_low_s(&eth_sig)?;

    let hash = hash_to_eth_signed_msg_hash(msg);

    let recid = RecoveryId::from_i32(parity.into())
        .map_err(|_| Error::InvalidSignature("recovery id out of range"))?;
    let sig = RecoverableSignature::from_compact(&eth_sig.0[..64], recid)
        .map_err(|_| Error::InvalidSignature("r or s out of range"))?;

    let pk = Secp256k1::verification_only()
        .recover_ecdsa(&Message::from(hash), &sig)
        .map_err(|_| Error::InvalidSignature("no public key recoverable"))?;

    Ok(pk.into())
}
