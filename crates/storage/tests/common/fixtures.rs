//! Payload helpers shared by the backend suites.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of an object body.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Object body of `len` bytes derived from `seed`; equal seeds give equal bodies.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut body = BytesMut::with_capacity(len + 8);
    let mut state = seed ^ 0x2545_F491_4F6C_DD1D;
    while body.len() < len {
        // xorshift64 never leaves zero, so keep the state non-zero.
        state = if state == 0 { 1 } else { state };
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        body.put_u64_le(state);
    }
    body.truncate(len);
    body.freeze()
}
