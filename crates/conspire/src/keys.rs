//! Key identities
//!
//! A [`KeyEntry`] is one X25519 recipient plus the labels that name its
//! owner and, in the private collection, its (possibly passphrase-locked)
//! identity. Key ids and fingerprints are derived from the recipient, never
//! stored, so a collection can't disagree with itself about who a key is.

use crate::error::{Result, VaultError};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

pub const FINGERPRINT_LEN: usize = 20;

/// 64-bit key identifier, the primary lookup key within a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub u64);

impl KeyId {
    /// Parse a candidate id: exactly 8 raw bytes written as 16 hex characters
    pub fn parse(candidate: &str) -> Result<Self> {
        let bytes = hex::decode(candidate.trim())
            .map_err(|_| VaultError::InvalidKeyId(candidate.to_string()))?;
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| VaultError::InvalidKeyId(candidate.to_string()))?;
        Ok(Self(u64::from_be_bytes(raw)))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Fixed-length key fingerprint, displayed as two 10-byte halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Fingerprint of an age recipient: the first 20 bytes of SHA-256 over its encoding
    pub fn of_recipient(recipient: &age::x25519::Recipient) -> Self {
        let digest = Sha256::digest(recipient.to_string().as_bytes());
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Self(bytes)
    }

    /// The key id is the low 64 bits of the fingerprint
    pub fn key_id(&self) -> KeyId {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[FINGERPRINT_LEN - 8..]);
        KeyId(u64::from_be_bytes(raw))
    }

    pub fn halves(&self) -> (String, String) {
        let (head, tail) = self.0.split_at(FINGERPRINT_LEN / 2);
        (hex::encode_upper(head), hex::encode_upper(tail))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (head, tail) = self.halves();
        write!(f, "{} {}", head, tail)
    }
}

/// Private half of a key as stored in the private collection
#[derive(Clone)]
pub enum PrivateMaterial {
    /// Unprotected age identity (`AGE-SECRET-KEY-1...`)
    Clear(Zeroizing<String>),
    /// Age passphrase file (armored) wrapping the identity
    Locked(String),
}

impl fmt::Debug for PrivateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear(_) => f.write_str("Clear(..)"),
            Self::Locked(_) => f.write_str("Locked(..)"),
        }
    }
}

/// One cryptographic identity within a collection
#[derive(Clone)]
pub struct KeyEntry {
    key_id: KeyId,
    fingerprint: Fingerprint,
    recipient: age::x25519::Recipient,
    /// Human-readable labels, e.g. `Sherlock Holmes <sherlock@bakerstreet.co.uk>`
    pub identities: Vec<String>,
    private: Option<PrivateMaterial>,
}

impl KeyEntry {
    pub fn new(recipient: age::x25519::Recipient, identities: Vec<String>) -> Self {
        let fingerprint = Fingerprint::of_recipient(&recipient);

        Self {
            key_id: fingerprint.key_id(),
            fingerprint,
            recipient,
            identities,
            private: None,
        }
    }

    pub fn with_private(mut self, material: PrivateMaterial) -> Self {
        self.private = Some(material);
        self
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn recipient(&self) -> &age::x25519::Recipient {
        &self.recipient
    }

    pub fn private(&self) -> Option<&PrivateMaterial> {
        self.private.as_ref()
    }

    /// Whether unlocking this key needs a passphrase
    pub fn is_locked(&self) -> bool {
        matches!(self.private, Some(PrivateMaterial::Locked(_)))
    }

    /// Copy of this entry without any private material
    pub fn to_public(&self) -> Self {
        Self {
            private: None,
            ..self.clone()
        }
    }

    /// `"Name <mail> Other" (KEYID)`, used in prompts
    pub fn describe(&self) -> String {
        format!("\"{}\" ({})", self.identities.join(" "), self.key_id)
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("key_id", &self.key_id)
            .field("identities", &self.identities)
            .field("private", &self.private)
            .finish()
    }
}

/// A private key ready for decryption
pub struct UnlockedKey {
    pub key_id: KeyId,
    pub identity: age::x25519::Identity,
}

impl fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use age::secrecy::ExposeSecret;

    /// Fresh key with clear private material
    pub fn private_key(name: &str) -> KeyEntry {
        let identity = age::x25519::Identity::generate();
        let secret = Zeroizing::new(identity.to_string().expose_secret().clone());
        KeyEntry::new(identity.to_public(), vec![name.to_string()])
            .with_private(PrivateMaterial::Clear(secret))
    }
}
