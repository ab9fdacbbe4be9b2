//! Standard paths used by conspire

use std::path::{Path, PathBuf};

/// File name of the local private-key collection inside the key home
pub const SECRET_RING: &str = "secring.asc";

/// File name of the local public-key collection inside the key home
pub const PUBLIC_RING: &str = "pubring.asc";

/// Locations of the key collections and the vault directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Key home (~/.conspire or $CONSPIRE_HOME)
    pub key_home: PathBuf,
    /// Private-key collection (<key home>/secring.asc)
    pub secret_ring: PathBuf,
    /// Public-key collection (<key home>/pubring.asc)
    pub public_ring: PathBuf,
    /// Vault directory holding one file per secret and per group
    pub vault: PathBuf,
}

impl Paths {
    pub fn new(key_home: impl Into<PathBuf>, vault: impl Into<PathBuf>) -> Self {
        let key_home = key_home.into();
        let secret_ring = key_home.join(SECRET_RING);
        let public_ring = key_home.join(PUBLIC_RING);

        Self {
            key_home,
            secret_ring,
            public_ring,
            vault: vault.into(),
        }
    }

    /// Default key home under the user's home directory
    pub fn default_key_home(home: &Path) -> PathBuf {
        home.join(".conspire")
    }

    /// Path of a file (secret or group) inside the vault
    pub fn vault_entry(&self, name: &str) -> PathBuf {
        self.vault.join(name)
    }
}
