//! Common cryptography helper functions for Tessera

use crate::hash::Hash;
use sha2::{Digest, Sha256};

/// Double SHA-256 of `data`, the digest used for block and transaction ids
pub fn sha256d(data: &[u8]) -> Hash<32> {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash::new(out)
}

/// Double SHA-256 of the concatenation of two digests (merkle tree node)
pub fn sha256d_pair(left: &Hash<32>, right: &Hash<32>) -> Hash<32> {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_ref());
    buf[32..].copy_from_slice(right.as_ref());
    sha256d(&buf)
}
