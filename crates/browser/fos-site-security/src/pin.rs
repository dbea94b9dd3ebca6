//! Public Key Pins
//!
//! SHA-256 SPKI digests and the pin sets built from them.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Digest length of a pin-sha256 value
pub const SPKI_HASH_LEN: usize = 32;

/// SHA-256 digest of a DER-encoded SubjectPublicKeyInfo
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpkiHash([u8; SPKI_HASH_LEN]);

impl SpkiHash {
    pub fn from_bytes(bytes: [u8; SPKI_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a standard base64 digest; `None` unless it decodes to 32 bytes
    pub fn from_base64(encoded: &str) -> Option<Self> {
        let bytes = BASE64.decode(encoded.trim()).ok()?;
        let bytes: [u8; SPKI_HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hash a DER-encoded SubjectPublicKeyInfo
    pub fn of_spki_der(spki: &[u8]) -> Self {
        Self(Sha256::digest(spki).into())
    }

    pub fn as_bytes(&self) -> &[u8; SPKI_HASH_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for SpkiHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpkiHash({})", self.to_base64())
    }
}

impl fmt::Display for SpkiHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl Serialize for SpkiHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for SpkiHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded)
            .ok_or_else(|| serde::de::Error::custom("expected a base64 SHA-256 digest"))
    }
}

/// One pinned key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub hash: SpkiHash,
    /// Not seen in the chain that delivered the policy
    pub is_backup: bool,
}

/// Ordered, duplicate-free set of pins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSet {
    pins: Vec<Pin>,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from hashes whose role is not known (API or preload data)
    pub fn from_hashes<I: IntoIterator<Item = SpkiHash>>(hashes: I) -> Self {
        let mut set = Self::new();
        for hash in hashes {
            set.insert(Pin { hash, is_backup: false });
        }
        set
    }

    /// Classify header pins against the hashes of the delivering chain
    ///
    /// Pins present in the chain are active, the rest are backups.
    pub fn classify(hashes: &[SpkiHash], chain: &[SpkiHash]) -> Self {
        let mut set = Self::new();
        for hash in hashes {
            set.insert(Pin {
                hash: *hash,
                is_backup: !chain.contains(hash),
            });
        }
        set
    }

    /// Add a pin; a hash already present is kept as is
    pub fn insert(&mut self, pin: Pin) -> bool {
        if self.contains(&pin.hash) {
            return false;
        }
        self.pins.push(pin);
        true
    }

    pub fn contains(&self, hash: &SpkiHash) -> bool {
        self.pins.iter().any(|p| p.hash == *hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pin> {
        self.pins.iter()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn has_active(&self) -> bool {
        self.pins.iter().any(|p| !p.is_backup)
    }

    pub fn has_backup(&self) -> bool {
        self.pins.iter().any(|p| p.is_backup)
    }

    /// Check if any key in the chain is pinned
    pub fn matches_chain(&self, chain: &[SpkiHash]) -> bool {
        chain.iter().any(|hash| self.contains(hash))
    }
}
