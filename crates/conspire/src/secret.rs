//! SecretStore - the secret lifecycle
//!
//! `get` decrypts, `edit` round-trips the plaintext through an external
//! editor, `recrypt` re-encrypts to the group's current members. Every
//! write of a secret is an atomic replacement, and the plaintext scratch
//! file used by `edit` is removed on every exit path.

use crate::engine::{AgeEngine, CryptoEngine, Envelope};
use crate::error::{Result, VaultError};
use crate::keyring::KeyStore;
use crate::keys::{KeyEntry, KeyId};
use crate::passphrase::PassphraseBroker;
use crate::persist;
use crate::scratch::{DeferInterrupts, ScratchFile};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use zeroize::Zeroizing;

const BEGIN_PLAINTEXT: &str = "-----BEGIN UNENCRYPTED SECRET----";
const END_PLAINTEXT: &str = "-----END UNENCRYPTED SECRET----";

/// A decrypted secret and the key ids its ciphertext was addressed to
pub struct Decrypted {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub recipients: Vec<KeyId>,
}

pub struct SecretStore<E: CryptoEngine = AgeEngine> {
    keystore: KeyStore,
    engine: E,
    broker: PassphraseBroker,
}

impl<E: CryptoEngine> SecretStore<E> {
    pub fn new(keystore: KeyStore, engine: E, broker: PassphraseBroker) -> Self {
        Self {
            keystore,
            engine,
            broker,
        }
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Decrypt a stored secret
    ///
    /// Candidate keys are the local private keys the envelope names as
    /// recipients, or every local private key when it names none.
    pub fn get(&mut self, name: &str) -> Result<Decrypted> {
        let path = self.keystore.vault_path(name)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VaultError::SecretNotFound(name.to_string()))
            }
            Err(e) => return Err(VaultError::read(&path, e)),
        };
        let envelope = Envelope::from_armor(&text).map_err(|e| VaultError::malformed(&path, e))?;

        let ring = self.keystore.private_ring()?;
        let candidates: Vec<KeyEntry> = if envelope.recipients.is_empty() {
            ring
        } else {
            ring.into_iter()
                .filter(|k| envelope.recipients.contains(&k.key_id()))
                .collect()
        };

        let engine = &self.engine;
        let plaintext = self
            .broker
            .unlock_with(&candidates, engine, |key| engine.decrypt(&envelope, &key))?;

        for id in &envelope.recipients {
            tracing::info!("Secret encrypted for {}", id);
        }

        Ok(Decrypted {
            plaintext,
            recipients: envelope.recipients,
        })
    }

    /// Decrypt a secret and write the plaintext to `out`
    pub fn show(&mut self, name: &str, verbose: bool, out: &mut dyn Write) -> Result<()> {
        let secret = self.get(name)?;

        let written: io::Result<()> = (|| {
            if verbose {
                writeln!(out)?;
                writeln!(out, "{}", BEGIN_PLAINTEXT)?;
            }
            out.write_all(&secret.plaintext)?;
            if verbose {
                // END marker on its own line, without doubling a trailing newline
                if !secret.plaintext.is_empty() && !secret.plaintext.ends_with(b"\n") {
                    writeln!(out)?;
                }
                writeln!(out, "{}", END_PLAINTEXT)?;
            }
            out.flush()
        })();

        written.map_err(VaultError::Output)
    }

    /// Edit a secret in `editor`, creating it if it doesn't exist yet, and
    /// store the result encrypted to the current members of `group`
    pub fn edit(&mut self, name: &str, group: &str, editor: &str) -> Result<()> {
        let path = self.keystore.vault_path(name)?;
        let vault = self.keystore.paths().vault.clone();

        let plaintext = match self.get(name) {
            Ok(secret) => secret.plaintext,
            Err(VaultError::SecretNotFound(_)) => {
                tracing::info!("Secret {} doesn't exist. Will create it.", name);
                Zeroizing::new(vec![])
            }
            Err(e) => return Err(e),
        };

        let mut scratch =
            ScratchFile::create(&vault, name).map_err(|e| VaultError::persist(&vault, e))?;

        let result = scratch
            .write_all(&plaintext)
            .map_err(|e| VaultError::persist(scratch.path(), e))
            .and_then(|_| run_editor(editor, scratch.path()))
            .and_then(|_| {
                let edited = scratch
                    .read_back()
                    .map_err(|e| VaultError::read(scratch.path(), e))?;
                self.encrypt_and_store(&path, group, &edited)
            });
        drop(plaintext);

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.remove() {
            tracing::error!(
                "Couldn't remove unencrypted temp file {}. You should remove it manually: {}",
                scratch_path.display(),
                e
            );
        }

        result
    }

    /// Re-encrypt an existing secret to the current members of `group`
    ///
    /// Removing someone from a group only revokes their access to a secret
    /// once it has been recrypted.
    pub fn recrypt(&mut self, name: &str, group: &str) -> Result<()> {
        let path = self.keystore.vault_path(name)?;
        let secret = self.get(name)?;
        self.encrypt_and_store(&path, group, &secret.plaintext)
    }

    fn encrypt_and_store(&self, path: &Path, group: &str, plaintext: &[u8]) -> Result<()> {
        // Loaded now, not before editing, so membership changes made meanwhile count
        let members = self.keystore.group(group)?;
        if members.is_empty() {
            return Err(VaultError::EmptyGroup(group.to_string()));
        }

        for member in &members {
            tracing::info!("Encrypting for {}", member.describe());
        }

        let envelope = self.engine.encrypt(plaintext, &members)?;
        persist::write_atomic(path, envelope.to_armor().as_bytes())
    }
}

/// Run `editor` (split on whitespace) on `path` in the foreground
fn run_editor(editor: &str, path: &Path) -> Result<()> {
    let failed = |reason: String| VaultError::Editor {
        editor: editor.to_string(),
        path: path.to_path_buf(),
        reason,
    };

    let mut words = editor.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| failed("no editor command".to_string()))?;

    let _defer = DeferInterrupts::new();
    let status = Command::new(program)
        .args(words)
        .arg(path)
        .status()
        .map_err(|e| failed(e.to_string()))?;

    if !status.success() {
        return Err(failed(format!("editor {}", status)));
    }

    Ok(())
}
