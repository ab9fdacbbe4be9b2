//! PassphraseBroker - unlocking private keys
//!
//! Candidate keys are tried in collection order. Each locked key gets its
//! own budget of [`MAX_ATTEMPTS`] passphrases; the first key that unlocks
//! wins. Where passphrases come from is a [`PassphraseSource`], chosen once
//! per process: the controlling terminal, or a passphrase agent when
//! `GPG_AGENT_INFO` is set.

use crate::agent::AgentClient;
use crate::engine::CryptoEngine;
use crate::error::{Result, VaultError};
use crate::keys::{KeyEntry, UnlockedKey};
use age::secrecy::SecretString;
use conspire_core::Config;

/// Passphrase attempts allowed per key
pub const MAX_ATTEMPTS: u32 = 3;

const WRONG_PASSPHRASE: &str = "Wrong passphrase. Please try again.";

/// What a source is asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseRequest {
    /// Identifies the target key in the agent's cache (the key id)
    pub cache_id: String,
    /// Error from the previous attempt, shown on retry
    pub error: Option<String>,
    pub prompt: String,
    pub description: String,
    /// Whether the agent may cache the passphrase it collects
    pub cacheable: bool,
}

impl PassphraseRequest {
    pub fn for_key(key: &KeyEntry) -> Self {
        Self {
            cache_id: key.key_id().to_string(),
            error: None,
            prompt: "Passphrase:".to_string(),
            description: format!(
                "You need a passphrase to unlock the secret key for {}",
                key.describe()
            ),
            cacheable: true,
        }
    }
}

pub enum PassphraseResponse {
    Passphrase(SecretString),
    Cancelled,
}

/// Where passphrases come from
pub trait PassphraseSource {
    fn get_passphrase(&mut self, request: &PassphraseRequest) -> Result<PassphraseResponse>;

    /// Drop any cached passphrase for `cache_id` so a wrong value is never reused
    fn forget(&mut self, cache_id: &str) -> Result<()>;
}

/// Reads passphrases from the controlling terminal without echo
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl PassphraseSource for TerminalPrompt {
    fn get_passphrase(&mut self, request: &PassphraseRequest) -> Result<PassphraseResponse> {
        if let Some(error) = &request.error {
            eprintln!("{}", error);
        }

        eprintln!("{}", request.description);
        let passphrase = rpassword::prompt_password(format!("{} ", request.prompt))
            .map_err(VaultError::Prompt)?;

        Ok(PassphraseResponse::Passphrase(SecretString::new(passphrase)))
    }

    fn forget(&mut self, _cache_id: &str) -> Result<()> {
        Ok(())
    }
}

pub struct PassphraseBroker {
    source: Box<dyn PassphraseSource>,
}

impl PassphraseBroker {
    pub fn new(source: Box<dyn PassphraseSource>) -> Self {
        Self { source }
    }

    /// Pick the backend for this process: the agent when one is configured
    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.agent_info {
            Some(info) => {
                tracing::info!("Will try passphrase agent");
                let client = AgentClient::connect(info)?;
                Ok(Self::new(Box::new(client)))
            }
            None => Ok(Self::new(Box::new(TerminalPrompt))),
        }
    }

    /// Unlock the first candidate that accepts a passphrase
    pub fn unlock(
        &mut self,
        candidates: &[KeyEntry],
        engine: &dyn CryptoEngine,
    ) -> Result<UnlockedKey> {
        self.unlock_with(candidates, engine, Ok)
    }

    /// Unlock candidates in order and hand each unlocked key to `attempt`
    /// until one succeeds
    ///
    /// A failed `attempt` (e.g. a key that is not a recipient after all)
    /// moves on to the next candidate. Fails with `PassphraseExhausted` if
    /// some locked key used up its attempts, and with `NoUsableKey` if no
    /// candidate worked for any other reason.
    pub fn unlock_with<T, F>(
        &mut self,
        candidates: &[KeyEntry],
        engine: &dyn CryptoEngine,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(UnlockedKey) -> Result<T>,
    {
        let mut exhausted = false;

        for key in candidates.iter().filter(|k| k.private().is_some()) {
            let unlocked = if key.is_locked() {
                match self.unlock_locked(key, engine)? {
                    Some(unlocked) => unlocked,
                    None => {
                        exhausted = true;
                        continue;
                    }
                }
            } else {
                match engine.unlock(key, None) {
                    Ok(unlocked) => unlocked,
                    Err(e) => {
                        tracing::warn!(key_id = %key.key_id(), "skipping unusable key: {}", e);
                        continue;
                    }
                }
            };

            match attempt(unlocked) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::debug!(key_id = %key.key_id(), "key didn't work, trying next: {}", e);
                }
            }
        }

        if exhausted {
            Err(VaultError::PassphraseExhausted(MAX_ATTEMPTS))
        } else {
            Err(VaultError::NoUsableKey)
        }
    }

    /// Up to MAX_ATTEMPTS tries for one key; `None` once the budget is spent
    fn unlock_locked(
        &mut self,
        key: &KeyEntry,
        engine: &dyn CryptoEngine,
    ) -> Result<Option<UnlockedKey>> {
        let mut request = PassphraseRequest::for_key(key);

        for attempt in 1..=MAX_ATTEMPTS {
            let passphrase = match self.source.get_passphrase(&request)? {
                PassphraseResponse::Passphrase(p) => p,
                PassphraseResponse::Cancelled => return Err(VaultError::Cancelled),
            };

            match engine.unlock(key, Some(&passphrase)) {
                Ok(unlocked) => return Ok(Some(unlocked)),
                Err(e) => {
                    tracing::debug!(key_id = %key.key_id(), attempt, "unlock failed: {}", e);
                    self.source.forget(&request.cache_id)?;
                    request.error = Some(WRONG_PASSPHRASE.to_string());
                }
            }
        }

        tracing::warn!(
            key_id = %key.key_id(),
            "No valid passphrase after {} tries",
            MAX_ATTEMPTS
        );
        Ok(None)
    }
}
