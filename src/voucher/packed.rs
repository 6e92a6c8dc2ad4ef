//! Solidity `abi.encodePacked` for the handful of static types a voucher
//! needs.
//!
//! Unlike the regular abi encoding nothing is padded to 32-byte slots: an
//! `address` takes 20 bytes, `uint256` and `bytes32` take 32 bytes, and
//! values are simply concatenated.

use crate::types::{Address, Hash, U256};
use sha3::{Digest, Keccak256};

pub trait Writer {
    fn write(&mut self, bytes: &[u8]);
}

impl Writer for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Hashes the packed bytes without materialising them.
#[derive(Default)]
pub struct Keccak256Writer {
    hasher: Keccak256,
}

impl Writer for Keccak256Writer {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

impl Keccak256Writer {
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

/// A value with a packed (non-standard) abi encoding.
pub trait Packed {
    /// Number of bytes written by [Packed::write_packed].
    const SIZE: usize;

    fn write_packed<W: Writer>(&self, writer: &mut W);
}

impl Packed for Address {
    const SIZE: usize = 20;

    fn write_packed<W: Writer>(&self, writer: &mut W) {
        writer.write(&self.0);
    }
}

impl Packed for Hash {
    const SIZE: usize = 32;

    fn write_packed<W: Writer>(&self, writer: &mut W) {
        writer.write(&self.0);
    }
}

impl Packed for U256 {
    const SIZE: usize = 32;

    fn write_packed<W: Writer>(&self, writer: &mut W) {
        writer.write(&self.to_be_bytes());
    }
}

impl<A: Packed, B: Packed> Packed for (A, B) {
    const SIZE: usize = A::SIZE + B::SIZE;

    fn write_packed<W: Writer>(&self, writer: &mut W) {
        self.0.write_packed(writer);
        self.1.write_packed(writer);
    }
}

pub fn to_bytes<T: Packed>(value: &T) -> Vec<u8> {
    let mut buf = Vec::with_capacity(T::SIZE);
    value.write_packed(&mut buf);
    buf
}

/// `keccak256(abi.encodePacked(value))`
pub fn to_hash<T: Packed>(value: &T) -> Hash {
    let mut writer = Keccak256Writer::default();
    value.write_packed(&mut writer);
    writer.finalize()
}
