//! KeyStore - loading and persisting key collections
//!
//! Three kinds of collection live on disk, all armored JSON:
//! - the local private ring (`secring.asc`): recipients plus identities
//! - the local public ring (`pubring.asc`)
//! - one group file per group inside the vault, public keys only
//!
//! Group files are read and written through [`PublicRecord`], which has
//! nowhere to put private material and refuses unknown fields.
//!
//! The rings are filled by importing existing age keys: recipients into the
//! public ring, `age-keygen` identity files (plain, or passphrase-protected
//! with `age -p -a`) into the private ring. Key generation is left to age.

use crate::armor::{self, BlockKind};
use crate::error::{Result, VaultError};
use crate::keys::{KeyEntry, KeyId, PrivateMaterial};
use crate::persist;
use conspire_core::Paths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// The group used when none is named
pub const DEFAULT_GROUP: &str = "default";

const SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-";
const AGE_ARMOR_BEGIN: &str = "-----BEGIN AGE ENCRYPTED FILE-----";

/// Result of adding a key to a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imported {
    Added(KeyId),
    /// A key with this id was already in the ring; the ring is unchanged
    AlreadyPresent(KeyId),
}

impl Imported {
    pub fn key_id(&self) -> KeyId {
        match self {
            Imported::Added(id) | Imported::AlreadyPresent(id) => *id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PublicRecord {
    recipient: String,
    #[serde(default)]
    identities: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PrivateRecord {
    recipient: String,
    #[serde(default)]
    identities: Vec<String>,
    key: PrivateKeyRecord,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PrivateKeyRecord {
    Clear(String),
    Locked(String),
}

/// Owns the on-disk key collections for one invocation
#[derive(Debug, Clone)]
pub struct KeyStore {
    paths: Paths,
}

impl KeyStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Path of a secret or group file, rejecting names that could escape the vault
    pub fn vault_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.paths.vault_entry(name))
    }

    /// The local public-key collection
    pub fn public_ring(&self) -> Result<Vec<KeyEntry>> {
        read_public(&self.paths.public_ring)
    }

    /// The local private-key collection
    pub fn private_ring(&self) -> Result<Vec<KeyEntry>> {
        read_private(&self.paths.secret_ring)
    }

    /// Members of a group; a missing group file is an error
    pub fn group(&self, group: &str) -> Result<Vec<KeyEntry>> {
        read_public(&self.vault_path(group)?)
    }

    /// Members of a group, or `None` if the group has never been created
    pub fn group_if_exists(&self, group: &str) -> Result<Option<Vec<KeyEntry>>> {
        match self.group(group) {
            Ok(members) => Ok(Some(members)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace a group file with `members` (public material only)
    pub fn save_group(&self, group: &str, members: &[KeyEntry]) -> Result<()> {
        let path = self.vault_path(group)?;
        persist::write_atomic(&path, encode_public(members)?.as_bytes())
    }

    pub fn save_public_ring(&self, keys: &[KeyEntry]) -> Result<()> {
        self.ensure_key_home()?;
        persist::write_atomic(&self.paths.public_ring, encode_public(keys)?.as_bytes())
    }

    pub fn save_private_ring(&self, keys: &[KeyEntry]) -> Result<()> {
        self.ensure_key_home()?;
        let text = encode_private(&self.paths.secret_ring, keys)?;
        persist::write_atomic(&self.paths.secret_ring, text.as_bytes())
    }

    /// The public ring, or nothing if it hasn't been created yet
    pub fn public_ring_or_empty(&self) -> Result<Vec<KeyEntry>> {
        or_empty(self.public_ring())
    }

    /// The private ring, or nothing if it hasn't been created yet
    pub fn private_ring_or_empty(&self) -> Result<Vec<KeyEntry>> {
        or_empty(self.private_ring())
    }

    /// Add an age recipient (`age1...`) to the public ring
    pub fn import_public(&self, recipient: &str, identities: Vec<String>) -> Result<Imported> {
        let recipient = recipient
            .trim()
            .parse::<age::x25519::Recipient>()
            .map_err(|e| VaultError::InvalidKey(format!("{}: {}", recipient.trim(), e)))?;
        self.add_public(KeyEntry::new(recipient, identities))
    }

    /// Add an age identity file to the private ring, and its public half to
    /// the public ring
    ///
    /// `text` is either `age-keygen` output or that output encrypted with a
    /// passphrase and armored. The public half of a protected identity
    /// can't be derived without the passphrase, so it must be given as
    /// `recipient`; for a plain identity a given `recipient` must match.
    pub fn import_private(
        &self,
        text: &str,
        recipient: Option<&str>,
        identities: Vec<String>,
    ) -> Result<Imported> {
        let recipient = recipient
            .map(|r| {
                r.trim()
                    .parse::<age::x25519::Recipient>()
                    .map_err(|e| VaultError::InvalidKey(format!("{}: {}", r.trim(), e)))
            })
            .transpose()?;

        let entry = if text.trim_start().starts_with(AGE_ARMOR_BEGIN) {
            let recipient = recipient.ok_or_else(|| {
                VaultError::InvalidKey(
                    "a passphrase-protected identity needs its recipient".to_string(),
                )
            })?;
            KeyEntry::new(recipient, identities)
                .with_private(PrivateMaterial::Locked(text.trim().to_string()))
        } else {
            let secret = parse_identity_file(text)?;
            let identity = secret
                .parse::<age::x25519::Identity>()
                .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
            let public = identity.to_public();

            if let Some(given) = &recipient {
                if given.to_string() != public.to_string() {
                    return Err(VaultError::InvalidKey(format!(
                        "identity does not belong to {}",
                        given
                    )));
                }
            }
            KeyEntry::new(public, identities).with_private(PrivateMaterial::Clear(secret))
        };

        let mut ring = self.private_ring_or_empty()?;
        if ring.iter().any(|k| k.key_id() == entry.key_id()) {
            return Ok(Imported::AlreadyPresent(entry.key_id()));
        }
        ring.push(entry.clone());
        self.save_private_ring(&ring)?;
        tracing::info!(key_id = %entry.key_id(), "imported private key");

        self.add_public(entry.to_public())?;
        Ok(Imported::Added(entry.key_id()))
    }

    fn add_public(&self, entry: KeyEntry) -> Result<Imported> {
        let mut ring = self.public_ring_or_empty()?;
        if ring.iter().any(|k| k.key_id() == entry.key_id()) {
            return Ok(Imported::AlreadyPresent(entry.key_id()));
        }

        let id = entry.key_id();
        ring.push(entry);
        self.save_public_ring(&ring)?;
        tracing::info!(key_id = %id, "imported public key");
        Ok(Imported::Added(id))
    }

    fn ensure_key_home(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.key_home)
            .map_err(|e| VaultError::persist(&self.paths.key_home, e))
    }
}

/// Secret and group names are plain file names that never start with a dot
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VaultError::InvalidName("name cannot be empty".to_string()));
    }

    if name.starts_with('.') {
        return Err(VaultError::InvalidName(format!(
            "{} (names starting with '.' are reserved)",
            name
        )));
    }

    if name.contains(['/', '\\', '\0']) {
        return Err(VaultError::InvalidName(format!(
            "{} (names cannot contain path separators)",
            name
        )));
    }

    Ok(())
}

fn or_empty(ring: Result<Vec<KeyEntry>>) -> Result<Vec<KeyEntry>> {
    match ring {
        Ok(keys) => Ok(keys),
        Err(e) if e.is_not_found() => Ok(vec![]),
        Err(e) => Err(e),
    }
}

/// The single `AGE-SECRET-KEY-` line of an `age-keygen` file; `#` comments
/// and blank lines are skipped
pub(crate) fn parse_identity_file(text: &str) -> Result<Zeroizing<String>> {
    let mut keys = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));

    let key = match keys.next() {
        Some(line) if line.starts_with(SECRET_KEY_PREFIX) => line,
        Some(_) => {
            return Err(VaultError::InvalidKey(
                "not an age identity file".to_string(),
            ))
        }
        None => return Err(VaultError::InvalidKey("no identity found".to_string())),
    };

    if keys.next().is_some() {
        return Err(VaultError::InvalidKey(
            "only one identity per file can be imported".to_string(),
        ));
    }
    Ok(Zeroizing::new(key.to_string()))
}

fn read_armor(path: &Path, kind: BlockKind) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path).map_err(|e| VaultError::read(path, e))?;
    let block = armor::decode(&text, kind).map_err(|e| VaultError::malformed(path, e))?;
    Ok(block.data)
}

fn parse_recipient(path: &Path, recipient: &str) -> Result<age::x25519::Recipient> {
    recipient
        .parse::<age::x25519::Recipient>()
        .map_err(|e| VaultError::malformed(path, format!("bad recipient {}: {}", recipient, e)))
}

fn read_public(path: &Path) -> Result<Vec<KeyEntry>> {
    let data = read_armor(path, BlockKind::PublicKeys)?;
    let records: Vec<PublicRecord> =
        serde_json::from_slice(&data).map_err(|e| VaultError::malformed(path, e))?;

    records
        .into_iter()
        .map(|r| Ok(KeyEntry::new(parse_recipient(path, &r.recipient)?, r.identities)))
        .collect()
}

fn read_private(path: &Path) -> Result<Vec<KeyEntry>> {
    let data = Zeroizing::new(read_armor(path, BlockKind::PrivateKeys)?);
    let records: Vec<PrivateRecord> =
        serde_json::from_slice(&data).map_err(|e| VaultError::malformed(path, e))?;

    records
        .into_iter()
        .map(|r| {
            let material = match r.key {
                PrivateKeyRecord::Clear(secret) => PrivateMaterial::Clear(Zeroizing::new(secret)),
                PrivateKeyRecord::Locked(armored) => PrivateMaterial::Locked(armored),
            };
            Ok(KeyEntry::new(parse_recipient(path, &r.recipient)?, r.identities)
                .with_private(material))
        })
        .collect()
}

fn encode_public(keys: &[KeyEntry]) -> Result<String> {
    let records: Vec<PublicRecord> = keys
        .iter()
        .map(|k| PublicRecord {
            recipient: k.recipient().to_string(),
            identities: k.identities.clone(),
        })
        .collect();

    let json = serde_json::to_vec_pretty(&records)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;
    Ok(armor::encode(BlockKind::PublicKeys, &[], &json))
}

fn encode_private(path: &Path, keys: &[KeyEntry]) -> Result<String> {
    let records = keys
        .iter()
        .map(|k| {
            let key = match k.private() {
                Some(PrivateMaterial::Clear(secret)) => PrivateKeyRecord::Clear(secret.as_str().to_string()),
                Some(PrivateMaterial::Locked(armored)) => PrivateKeyRecord::Locked(armored.clone()),
                None => {
                    return Err(VaultError::malformed(
                        path,
                        format!("key {} has no private material", k.key_id()),
                    ))
                }
            };
            Ok(PrivateRecord {
                recipient: k.recipient().to_string(),
                identities: k.identities.clone(),
                key,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let json = Zeroizing::new(
        serde_json::to_vec_pretty(&records).map_err(|e| VaultError::Encryption(e.to_string()))?,
    );
    Ok(armor::encode(BlockKind::PrivateKeys, &[], &json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_support::private_key;
    use tempfile::{tempdir, TempDir};

    fn store() -> (KeyStore, TempDir) {
        let dir = tempdir().unwrap();
        let vault = dir.path().join("vault");
        fs::create_dir_all(&vault).unwrap();
        let store = KeyStore::new(Paths::new(dir.path().join("keys"), vault));
        (store, dir)
    }

    #[test]
    fn test_group_round_trip_keeps_order_and_identities() {
        let (store, _dir) = store();
        let holmes = private_key("Sherlock Holmes <sherlock.holmes@bakerstreet.co.uk>");
        let poirot = private_key("Hercule Poirot <hercule.poirot@whitehaven.co.uk>");

        store.save_group("detectives", &[holmes.clone(), poirot.clone()]).unwrap();
        let members = store.group("detectives").unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].key_id(), holmes.key_id());
        assert_eq!(members[1].key_id(), poirot.key_id());
        assert_eq!(members[1].identities, poirot.identities);
    }

    #[test]
    fn test_group_file_never_holds_private_material() {
        let (store, _dir) = store();
        let holmes = private_key("Sherlock Holmes");

        store.save_group(DEFAULT_GROUP, &[holmes]).unwrap();
        let text = fs::read_to_string(store.vault_path(DEFAULT_GROUP).unwrap()).unwrap();
        let block = armor::decode(&text, BlockKind::PublicKeys).unwrap();
        let json = String::from_utf8(block.data).unwrap();

        assert!(!json.contains("AGE-SECRET-KEY"));
        assert!(store.group(DEFAULT_GROUP).unwrap()[0].private().is_none());
    }

    #[test]
    fn test_group_with_private_fields_is_malformed() {
        let (store, _dir) = store();
        let holmes = private_key("Sherlock Holmes");

        // A private ring dropped into the vault under the public label
        store.save_private_ring(&[holmes]).unwrap();
        let text = fs::read_to_string(&store.paths().secret_ring).unwrap();
        let block = armor::decode(&text, BlockKind::PrivateKeys).unwrap();
        let disguised = armor::encode(BlockKind::PublicKeys, &[], &block.data);
        fs::write(store.vault_path("sneaky").unwrap(), disguised).unwrap();

        assert!(matches!(
            store.group("sneaky"),
            Err(VaultError::Malformed { .. })
        ));
    }

    #[test]
    fn test_private_ring_round_trip() {
        let (store, _dir) = store();
        let holmes = private_key("Sherlock Holmes");
        let locked = KeyEntry::new(private_key("Watson").recipient().clone(), vec![])
            .with_private(PrivateMaterial::Locked("-----BEGIN AGE ENCRYPTED FILE-----".into()));

        store.save_private_ring(&[holmes.clone(), locked.clone()]).unwrap();
        let ring = store.private_ring().unwrap();

        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0].key_id(), holmes.key_id());
        assert!(!ring[0].is_locked());
        assert!(ring[1].is_locked());
    }

    #[test]
    fn test_private_ring_refuses_public_only_keys() {
        let (store, _dir) = store();
        let public = private_key("Lestrade").to_public();
        assert!(store.save_private_ring(&[public]).is_err());
    }

    #[test]
    fn test_missing_and_malformed_groups() {
        let (store, _dir) = store();

        let err = store.group("nobody").unwrap_err();
        assert!(err.is_not_found());
        assert!(store.group_if_exists("nobody").unwrap().is_none());

        fs::write(store.vault_path("garbage").unwrap(), "not armor at all").unwrap();
        assert!(matches!(
            store.group_if_exists("garbage"),
            Err(VaultError::Malformed { .. })
        ));
    }

    const KEYGEN_FILE: &str = "# created: 2026-10-16T09:00:00Z\n# public key: {public}\n{secret}\n";

    fn keygen_file(identity: &age::x25519::Identity) -> String {
        use age::secrecy::ExposeSecret;
        KEYGEN_FILE
            .replace("{public}", &identity.to_public().to_string())
            .replace("{secret}", identity.to_string().expose_secret())
    }

    #[test]
    fn test_import_public_creates_ring() {
        let (store, _dir) = store();
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public().to_string();

        let imported = store
            .import_public(&recipient, vec!["Hercule Poirot".to_string()])
            .unwrap();
        assert!(matches!(imported, Imported::Added(_)));

        let ring = store.public_ring().unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0].key_id(), imported.key_id());
        assert_eq!(ring[0].identities, vec!["Hercule Poirot"]);

        // Second import of the same recipient changes nothing
        assert_eq!(
            store.import_public(&recipient, vec![]).unwrap(),
            Imported::AlreadyPresent(imported.key_id())
        );
        assert_eq!(store.public_ring().unwrap().len(), 1);

        assert!(matches!(
            store.import_public("age1nope", vec![]),
            Err(VaultError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_import_keygen_identity() {
        let (store, _dir) = store();
        let identity = age::x25519::Identity::generate();

        let imported = store
            .import_private(&keygen_file(&identity), None, vec!["Sherlock Holmes".to_string()])
            .unwrap();

        let private = store.private_ring().unwrap();
        assert_eq!(private.len(), 1);
        assert!(!private[0].is_locked());
        assert_eq!(private[0].recipient().to_string(), identity.to_public().to_string());
        assert_eq!(private[0].key_id(), imported.key_id());

        // The public half lands in the public ring, ready for `group add`
        let public = store.public_ring().unwrap();
        assert_eq!(public[0].key_id(), imported.key_id());
        assert!(public[0].private().is_none());

        let mode = {
            use std::os::unix::fs::PermissionsExt;
            fs::metadata(&store.paths().secret_ring).unwrap().permissions().mode()
        };
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_import_identity_checks_given_recipient() {
        let (store, _dir) = store();
        let identity = age::x25519::Identity::generate();
        let other = age::x25519::Identity::generate().to_public().to_string();

        assert!(matches!(
            store.import_private(&keygen_file(&identity), Some(&other), vec![]),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(store.private_ring_or_empty().unwrap().is_empty());
    }

    #[test]
    fn test_import_locked_identity_needs_recipient() {
        let (store, _dir) = store();
        let identity = age::x25519::Identity::generate();
        let locked = crate::engine::lock_identity(&identity, "elementary");

        assert!(matches!(
            store.import_private(&locked, None, vec![]),
            Err(VaultError::InvalidKey(_))
        ));

        let recipient = identity.to_public().to_string();
        store.import_private(&locked, Some(&recipient), vec![]).unwrap();
        let ring = store.private_ring().unwrap();
        assert!(ring[0].is_locked());
        assert_eq!(ring[0].recipient().to_string(), recipient);
    }

    #[test]
    fn test_parse_identity_file() {
        let identity = age::x25519::Identity::generate();
        let parsed = parse_identity_file(&keygen_file(&identity)).unwrap();
        assert!(parsed.starts_with(SECRET_KEY_PREFIX));

        assert!(parse_identity_file("# only comments\n\n").is_err());
        assert!(parse_identity_file("age1notasecret\n").is_err());

        let twice = format!("{}{}", keygen_file(&identity), keygen_file(&identity));
        assert!(parse_identity_file(&twice).is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("default").is_ok());
        assert!(validate_name("db-password.prod").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name(".conspire.lock").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("api/openai").is_err());
    }
}
