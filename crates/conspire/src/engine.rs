//! CryptoEngine - encryption, decryption and key unlocking
//!
//! The vault only talks to cryptography through [`CryptoEngine`]. The
//! shipped backend is [`AgeEngine`]: X25519 recipients, ChaCha20-Poly1305
//! payloads, and scrypt passphrase files for locked private keys.

use crate::armor::{self, BlockKind};
use crate::error::{Result, VaultError};
use crate::keyring::parse_identity_file;
use crate::keys::{KeyEntry, KeyId, PrivateMaterial, UnlockedKey};
use age::secrecy::SecretString;
use std::io::{Read, Write};
use zeroize::Zeroizing;

const RECIPIENTS_HEADER: &str = "Recipients";

/// An encrypted secret as stored in the vault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Key ids the payload claims to be encrypted to
    pub recipients: Vec<KeyId>,
    /// Raw age ciphertext
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn to_armor(&self) -> String {
        let recipients = self
            .recipients
            .iter()
            .map(KeyId::to_string)
            .collect::<Vec<_>>()
            .join(",");

        armor::encode(
            BlockKind::Message,
            &[(RECIPIENTS_HEADER, recipients)],
            &self.payload,
        )
    }

    /// Decode an armored envelope. Unparseable recipient ids are ignored:
    /// the header is only a hint for choosing which private key to unlock.
    pub fn from_armor(text: &str) -> std::result::Result<Self, armor::ArmorError> {
        let block = armor::decode(text, BlockKind::Message)?;

        let recipients = block
            .header(RECIPIENTS_HEADER)
            .map(|list| {
                list.split(',')
                    .filter_map(|id| KeyId::parse(id).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            recipients,
            payload: block.data,
        })
    }
}

pub trait CryptoEngine {
    /// Encrypt `plaintext` to every key in `recipients`
    fn encrypt(&self, plaintext: &[u8], recipients: &[KeyEntry]) -> Result<Envelope>;

    /// Decrypt an envelope with an unlocked private key
    fn decrypt(&self, envelope: &Envelope, key: &UnlockedKey) -> Result<Zeroizing<Vec<u8>>>;

    /// Unlock a private key; `passphrase` is ignored for unprotected keys
    fn unlock(&self, key: &KeyEntry, passphrase: Option<&SecretString>) -> Result<UnlockedKey>;
}

/// age-backed engine
#[derive(Debug, Default, Clone, Copy)]
pub struct AgeEngine;

impl AgeEngine {
    pub fn new() -> Self {
        Self
    }

    fn unlock_error(key: &KeyEntry, reason: impl ToString) -> VaultError {
        VaultError::Unlock {
            key_id: key.key_id().to_string(),
            reason: reason.to_string(),
        }
    }

    fn open_locked(
        key: &KeyEntry,
        armored: &str,
        passphrase: &SecretString,
    ) -> Result<Zeroizing<String>> {
        let reader = age::armor::ArmoredReader::new(armored.as_bytes());
        let decryptor = match age::Decryptor::new(reader).map_err(|e| Self::unlock_error(key, e))? {
            age::Decryptor::Passphrase(d) => d,
            _ => return Err(Self::unlock_error(key, "key is not passphrase protected")),
        };

        let mut stream = decryptor
            .decrypt(passphrase, None)
            .map_err(|e| Self::unlock_error(key, e))?;

        let mut identity = Zeroizing::new(String::new());
        stream
            .read_to_string(&mut identity)
            .map_err(|e| Self::unlock_error(key, e))?;
        Ok(identity)
    }
}

impl CryptoEngine for AgeEngine {
    fn encrypt(&self, plaintext: &[u8], recipients: &[KeyEntry]) -> Result<Envelope> {
        let boxed: Vec<Box<dyn age::Recipient + Send>> = recipients
            .iter()
            .map(|k| Box::new(k.recipient().clone()) as Box<dyn age::Recipient + Send>)
            .collect();

        let encryptor = age::Encryptor::with_recipients(boxed)
            .ok_or_else(|| VaultError::Encryption("no recipients".to_string()))?;

        let mut payload = vec![];
        let mut writer = encryptor
            .wrap_output(&mut payload)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        writer
            .write_all(plaintext)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        writer
            .finish()
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        Ok(Envelope {
            recipients: recipients.iter().map(KeyEntry::key_id).collect(),
            payload,
        })
    }

    fn decrypt(&self, envelope: &Envelope, key: &UnlockedKey) -> Result<Zeroizing<Vec<u8>>> {
        let decryptor = match age::Decryptor::new(&envelope.payload[..])
            .map_err(|e| VaultError::Decryption(e.to_string()))?
        {
            age::Decryptor::Recipients(d) => d,
            _ => {
                return Err(VaultError::Decryption(
                    "Unexpected passphrase encryption".to_string(),
                ))
            }
        };

        let mut plaintext = Zeroizing::new(vec![]);
        let mut reader = decryptor
            .decrypt(std::iter::once(&key.identity as &dyn age::Identity))
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        Ok(plaintext)
    }

    fn unlock(&self, key: &KeyEntry, passphrase: Option<&SecretString>) -> Result<UnlockedKey> {
        let secret = match key.private() {
            None => return Err(Self::unlock_error(key, "no private key material")),
            Some(PrivateMaterial::Clear(secret)) => secret.clone(),
            Some(PrivateMaterial::Locked(armored)) => {
                let passphrase =
                    passphrase.ok_or_else(|| Self::unlock_error(key, "passphrase required"))?;
                Self::open_locked(key, armored, passphrase)?
            }
        };

        // Protected identities are whole age-keygen files, comments included
        let secret = parse_identity_file(&secret).map_err(|e| Self::unlock_error(key, e))?;
        let identity = secret
            .parse::<age::x25519::Identity>()
            .map_err(|e| Self::unlock_error(key, e))?;

        // The private half must belong to the public half it is filed under
        if identity.to_public().to_string() != key.recipient().to_string() {
            return Err(Self::unlock_error(key, "private key does not match recipient"));
        }

        Ok(UnlockedKey {
            key_id: key.key_id(),
            identity,
        })
    }
}

/// Wrap an identity in an age passphrase file, as stored for locked keys
#[cfg(test)]
pub(crate) fn lock_identity(identity: &age::x25519::Identity, passphrase: &str) -> String {
    use age::secrecy::ExposeSecret;
    lock_text(identity.to_string().expose_secret(), passphrase)
}

/// Armored age passphrase encryption of `text`, like `age -p -a`
#[cfg(test)]
pub(crate) fn lock_text(text: &str, passphrase: &str) -> String {
    let encryptor = age::Encryptor::with_user_passphrase(SecretString::new(passphrase.to_owned()));
    let mut armored = vec![];
    let out = age::armor::ArmoredWriter::wrap_output(&mut armored, age::armor::Format::AsciiArmor)
        .unwrap();
    let mut writer = encryptor.wrap_output(out).unwrap();
    writer.write_all(text.as_bytes()).unwrap();
    writer.finish().and_then(|out| out.finish()).unwrap();
    String::from_utf8(armored).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_support::private_key;

    #[test]
    fn test_encrypt_decrypt() {
        let engine = AgeEngine::new();
        let holmes = private_key("Sherlock Holmes");
        let poirot = private_key("Hercule Poirot");

        let envelope = engine
            .encrypt(b"the game is afoot", &[holmes.to_public(), poirot.to_public()])
            .unwrap();
        assert_eq!(envelope.recipients, vec![holmes.key_id(), poirot.key_id()]);

        for key in [&holmes, &poirot] {
            let unlocked = engine.unlock(key, None).unwrap();
            let plaintext = engine.decrypt(&envelope, &unlocked).unwrap();
            assert_eq!(plaintext.as_slice(), b"the game is afoot");
        }
    }

    #[test]
    fn test_non_recipient_cannot_decrypt() {
        let engine = AgeEngine::new();
        let holmes = private_key("Sherlock Holmes");
        let moriarty = private_key("James Moriarty");

        let envelope = engine.encrypt(b"secret", &[holmes.to_public()]).unwrap();
        let unlocked = engine.unlock(&moriarty, None).unwrap();

        assert!(matches!(
            engine.decrypt(&envelope, &unlocked),
            Err(VaultError::Decryption(_))
        ));
    }

    #[test]
    fn test_encrypt_to_nobody_fails() {
        assert!(matches!(
            AgeEngine::new().encrypt(b"secret", &[]),
            Err(VaultError::Encryption(_))
        ));
    }

    #[test]
    fn test_envelope_armor_carries_recipients() {
        let engine = AgeEngine::new();
        let holmes = private_key("Sherlock Holmes");
        let envelope = engine.encrypt(b"secret", &[holmes.to_public()]).unwrap();

        let text = envelope.to_armor();
        assert!(text.contains(&format!("Recipients: {}", holmes.key_id())));

        let decoded = Envelope::from_armor(&text).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_without_recipient_header() {
        let text = armor::encode(BlockKind::Message, &[], b"payload");
        let envelope = Envelope::from_armor(&text).unwrap();
        assert!(envelope.recipients.is_empty());
        assert_eq!(envelope.payload, b"payload");
    }

    #[test]
    fn test_unlock_locked_key() {
        let engine = AgeEngine::new();
        let identity = age::x25519::Identity::generate();
        let key = KeyEntry::new(identity.to_public(), vec!["Irene Adler".to_string()])
            .with_private(PrivateMaterial::Locked(lock_identity(&identity, "the woman")));
        assert!(key.is_locked());

        assert!(engine.unlock(&key, None).is_err());

        let wrong = SecretString::new("the man".to_string());
        assert!(matches!(
            engine.unlock(&key, Some(&wrong)),
            Err(VaultError::Unlock { .. })
        ));

        let right = SecretString::new("the woman".to_string());
        let unlocked = engine.unlock(&key, Some(&right)).unwrap();
        assert_eq!(unlocked.key_id, key.key_id());
    }

    #[test]
    fn test_unlock_protected_keygen_file() {
        use age::secrecy::ExposeSecret;

        let identity = age::x25519::Identity::generate();
        let file = format!(
            "# created: 2026-10-16T09:00:00Z\n# public key: {}\n{}\n",
            identity.to_public(),
            identity.to_string().expose_secret()
        );
        let key = KeyEntry::new(identity.to_public(), vec![])
            .with_private(PrivateMaterial::Locked(lock_text(&file, "the woman")));

        let right = SecretString::new("the woman".to_string());
        let unlocked = AgeEngine::new().unlock(&key, Some(&right)).unwrap();
        assert_eq!(unlocked.key_id, key.key_id());
    }

    #[test]
    fn test_unlock_rejects_mismatched_private_half() {
        let engine = AgeEngine::new();
        let holmes = private_key("Sherlock Holmes");
        let watson = private_key("John Watson");

        let mismatched = KeyEntry::new(holmes.recipient().clone(), holmes.identities.clone())
            .with_private(watson.private().unwrap().clone());

        assert!(matches!(
            engine.unlock(&mismatched, None),
            Err(VaultError::Unlock { .. })
        ));
    }
}
