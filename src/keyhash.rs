//! Fixed-width key digests
//!
//! Big map keys are opaque byte blobs; the engine never interprets them
//! beyond digesting them into a fixed 32-byte identity used everywhere a
//! key must be compared, indexed, or locked.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed-width digest of a big map key, the canonical key identity.
///
/// Serialized as a hex string; ingestion may carry the on-chain hash
/// directly, otherwise [`KeyHash::digest`] derives one from the raw key
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHash(pub [u8; 32]);

impl KeyHash {
    /// Digest raw key bytes into a key hash
    pub fn digest(key: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key);
        KeyHash(hasher.finalize().into())
    }

    /// Hex rendering of the digest
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a key hash from its hex rendering
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Some(KeyHash(hash))
    }
}

impl std::fmt::Display for KeyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for KeyHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        KeyHash::from_hex(&s).ok_or_else(|| serde::de::Error::custom("Invalid key hash"))
    }
}
