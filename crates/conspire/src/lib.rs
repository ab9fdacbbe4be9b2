//! conspire - group-scoped secrets vault
//!
//! Secrets live in a vault directory as one armored, encrypted file each.
//! Groups (one armored public-key file each, in the same directory) decide
//! who a secret is encrypted for. Removing someone from a group revokes
//! their access once the affected secrets are recrypted.
//!
//! Uses age encryption (X25519 + ChaCha20-Poly1305).

pub mod agent;
pub mod armor;
pub mod display;
pub mod engine;
pub mod error;
pub mod group;
pub mod keyring;
pub mod keys;
pub mod passphrase;
pub mod persist;
pub mod scratch;
pub mod secret;

pub use engine::{AgeEngine, CryptoEngine, Envelope};
pub use error::{Result, VaultError};
pub use group::{AddOutcome, DeleteOutcome, GroupManager};
pub use keyring::{Imported, KeyStore, DEFAULT_GROUP};
pub use keys::{Fingerprint, KeyEntry, KeyId};
pub use passphrase::{PassphraseBroker, PassphraseSource};
pub use secret::{Decrypted, SecretStore};
