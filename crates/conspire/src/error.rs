//! Vault errors
//!
//! Everything that touches a file carries the offending path and the
//! underlying cause, so `main` can report it before exiting non-zero.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Couldn't read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't decode {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("Couldn't write {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Group {0} has no members to encrypt for")]
    EmptyGroup(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("{0} is not a valid key id")]
    InvalidKeyId(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("No usable private key for this secret")]
    NoUsableKey,

    #[error("No valid passphrase after {0} tries")]
    PassphraseExhausted(u32),

    #[error("Passphrase entry cancelled")]
    Cancelled,

    #[error("Couldn't unlock key {key_id}: {reason}")]
    Unlock { key_id: String, reason: String },

    #[error("Couldn't read passphrase: {0}")]
    Prompt(#[source] io::Error),

    #[error("Passphrase agent error: {0}")]
    Agent(String),

    #[error("Couldn't edit {} with editor {editor}: {reason}", path.display())]
    Editor {
        editor: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Couldn't write to standard output: {0}")]
    Output(#[source] io::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}

impl VaultError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }

    /// True for a missing file, as opposed to one that exists but can't be read
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}
