//! GroupManager - group membership
//!
//! Mutations are read-modify-write under the vault lock and end in one
//! atomic replacement of the group file, or no write at all when nothing
//! changed.

use crate::error::Result;
use crate::keyring::KeyStore;
use crate::keys::{KeyEntry, KeyId};
use crate::persist::VaultLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOutcome {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: usize,
    pub skipped: usize,
}

pub struct GroupManager<'a> {
    keystore: &'a KeyStore,
}

impl<'a> GroupManager<'a> {
    pub fn new(keystore: &'a KeyStore) -> Self {
        Self { keystore }
    }

    /// Members of `group`, in file order
    pub fn list(&self, group: &str) -> Result<Vec<KeyEntry>> {
        self.keystore.group(group)
    }

    /// Add public-ring keys to `group`, creating the group on first add
    ///
    /// Malformed ids, ids already in the group, and ids missing from the
    /// public ring are skipped.
    pub fn add<S: AsRef<str>>(&self, group: &str, candidates: &[S]) -> Result<AddOutcome> {
        let _lock = VaultLock::acquire(&self.keystore.paths().vault)?;

        let mut members = match self.keystore.group_if_exists(group)? {
            Some(members) => members,
            None => {
                tracing::info!("Group file {} doesn't exist. Will create it.", group);
                vec![]
            }
        };
        let public_ring = self.keystore.public_ring()?;

        tracing::info!("Adding users to group {}", group);
        let mut outcome = AddOutcome::default();

        for candidate in candidates {
            let candidate = candidate.as_ref();
            let key_id = match KeyId::parse(candidate) {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!("Key {} is not a valid KeyID. Skipping.", candidate);
                    outcome.skipped += 1;
                    continue;
                }
            };

            if members.iter().any(|m| m.key_id() == key_id) {
                tracing::info!("Key id {} is already in the group. Skipped.", key_id);
                outcome.skipped += 1;
                continue;
            }

            // Duplicate public-ring entries for one id still make one member
            match public_ring.iter().find(|k| k.key_id() == key_id) {
                Some(key) => {
                    tracing::info!("Adding key id {} ({})", key_id, key.identities.join(", "));
                    members.push(key.to_public());
                    outcome.added += 1;
                }
                None => {
                    tracing::warn!("Key id {} is not in the public keyring. Skipping.", key_id);
                    outcome.skipped += 1;
                }
            }
        }

        if outcome.added > 0 {
            self.keystore.save_group(group, &members)?;
        }

        Ok(outcome)
    }

    /// Remove every member matching one of `candidates` from `group`
    pub fn delete<S: AsRef<str>>(&self, group: &str, candidates: &[S]) -> Result<DeleteOutcome> {
        let _lock = VaultLock::acquire(&self.keystore.paths().vault)?;

        let mut retained = self.keystore.group(group)?;
        let mut outcome = DeleteOutcome::default();

        tracing::info!("Deleting users from group {}", group);

        for candidate in candidates {
            let candidate = candidate.as_ref();
            let key_id = match KeyId::parse(candidate) {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!("Key {} is not a valid KeyID. Skipping.", candidate);
                    outcome.skipped += 1;
                    continue;
                }
            };

            let before = retained.len();
            retained.retain(|m| m.key_id() != key_id);
            let removed = before - retained.len();

            if removed == 0 {
                tracing::info!("Key id {} is not in the group. Skipped.", key_id);
                outcome.skipped += 1;
            } else {
                tracing::info!("Deleting key id {}", key_id);
                outcome.deleted += removed;
            }
        }

        if outcome.deleted > 0 {
            self.keystore.save_group(group, &retained)?;
        }

        Ok(outcome)
    }
}
