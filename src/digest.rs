//! Streaming digest verification.
//!
//! Accumulates SHA-256 over a byte stream while counting size, then compares
//! against the digest the publisher declared using a constant-time equality
//! check so timing cannot leak how much of the expected digest matched.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::RegistryError;

pub struct DigestAccumulator {
    hasher: Sha256,
    size: u64,
}

impl Default for DigestAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestAccumulator {
    pub fn new() -> Self {
        DigestAccumulator { hasher: Sha256::new(), size: 0 }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> ComputedDigest {
        ComputedDigest { hex: hex::encode(self.hasher.finalize()), size: self.size }
    }
}

pub struct ComputedDigest {
    pub hex: String,
    pub size: u64,
}

impl ComputedDigest {
    /// Verify against the publisher-declared digest and size for one
    /// distribution, in constant time for the digest comparison.
    pub fn verify(&self, url: &str, expected_digest: &str, expected_size: Option<u64>) -> Result<(), RegistryError> {
        if let Some(expected_size) = expected_size {
            if expected_size != self.size {
                return Err(RegistryError::SizeMismatch {
                    url: url.to_string(),
                    expected: expected_size,
                    actual: self.size,
                });
            }
        }

        let expected_norm = expected_digest.to_lowercase();
        let actual_norm = self.hex.to_lowercase();
        let equal: bool = expected_norm.as_bytes().ct_eq(actual_norm.as_bytes()).into();
        if !equal {
            return Err(RegistryError::DigestMismatch {
                url: url.to_string(),
                expected: expected_norm,
                actual: actual_norm,
            });
        }

        Ok(())
    }
}
