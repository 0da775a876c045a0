//! Cryptographic hash types and incremental digest calculation.

use crc64fast_nvme::Digest as Crc64Digest;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex<const N: usize>(s: &str) -> crate::Result<[u8; N]> {
    if s.len() != N * 2 {
        return Err(crate::Error::InvalidHash(format!(
            "expected {} hex chars, got {}",
            N * 2,
            s.len()
        )));
    }
    let mut bytes = [0u8; N];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hex_str =
            std::str::from_utf8(chunk).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        bytes[i] = u8::from_str_radix(hex_str, 16)
            .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
    }
    Ok(bytes)
}

/// A SHA-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute SHA-256 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Encode as base64 string.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        decode_hex::<32>(s).map(Self)
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An MD5 hash, kept for clients that still address artifacts by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Md5Hash([u8; 16]);

impl Md5Hash {
    /// Compute MD5 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        decode_hex::<16>(s).map(Self)
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl fmt::Debug for Md5Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Hash({})", self.to_hex())
    }
}

impl fmt::Display for Md5Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the CRC-64/NVME checksum of data.
///
/// This is the full-object checksum S3 reports for multipart uploads created
/// with the `CRC64NVME` algorithm.
pub fn crc64(data: &[u8]) -> u64 {
    let mut digest = Crc64Digest::new();
    digest.write(data);
    digest.sum64()
}

/// Finalized digests of a received byte sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub md5: Md5Hash,
    pub sha256: ContentHash,
    pub crc64: u64,
}

/// Incremental MD5 + SHA-256 + CRC-64 calculator.
///
/// Bytes must be fed in receipt order; the result does not depend on how the
/// sequence was split into updates.
pub struct DigestCalculator {
    md5: Md5,
    sha256: Sha256,
    crc64: Crc64Digest,
    bytes: u64,
}

impl DigestCalculator {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha256: Sha256::new(),
            crc64: Crc64Digest::new(),
            bytes: 0,
        }
    }

    /// Update all accumulators with data.
    pub fn update(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.md5.update(data);
        self.sha256.update(data);
        self.crc64.write(data);
        self.bytes += data.len() as u64;
    }

    /// Update all accumulators with a single byte.
    pub fn update_byte(&mut self, b: u8) {
        self.update(&[b]);
    }

    /// Number of bytes digested so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Current CRC-64 value without finalizing the cryptographic hashes.
    pub fn crc64(&self) -> u64 {
        self.crc64.sum64()
    }

    /// Snapshot the digests of everything fed so far.
    ///
    /// The calculator remains usable afterwards.
    pub fn digests(&self) -> Digests {
        Digests {
            md5: Md5Hash(self.md5.clone().finalize().into()),
            sha256: ContentHash(self.sha256.clone().finalize().into()),
            crc64: self.crc64.sum64(),
        }
    }
}

impl Default for DigestCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DigestCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestCalculator")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_hex() {
        let hash = ContentHash::compute(b"hello world");
        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(ContentHash::from_hex("abc").is_err());
    }

    #[test]
    fn test_md5_known_value() {
        assert_eq!(
            Md5Hash::compute(b"hello world").to_hex(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn test_calculator_independent_of_split() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut whole = DigestCalculator::new();
        whole.update(&data);

        let mut split = DigestCalculator::new();
        let (head, tail) = data.split_at(4097);
        split.update(head);
        split.update_byte(tail[0]);
        for chunk in tail[1..].chunks(333) {
            split.update(chunk);
        }

        assert_eq!(whole.digests(), split.digests());
        assert_eq!(whole.bytes(), data.len() as u64);
        assert_eq!(whole.digests().sha256, ContentHash::compute(&data));
        assert_eq!(whole.digests().md5, Md5Hash::compute(&data));
        assert_eq!(whole.crc64(), crc64(&data));
    }

    #[test]
    fn test_snapshot_does_not_consume() {
        let mut calc = DigestCalculator::new();
        calc.update(b"abc");
        let first = calc.digests();
        calc.update(b"def");
        assert_ne!(first, calc.digests());
        assert_eq!(calc.digests().sha256, ContentHash::compute(b"abcdef"));
    }
}
