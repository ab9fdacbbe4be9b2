//! Process-wide configuration
//!
//! Built once in `main` from the environment and passed by reference into
//! every component. Recognized variables:
//! - CONSPIRE_HOME: directory holding secring.asc / pubring.asc (~/.conspire)
//! - CONSPIRACY_VAULT: vault directory (current working directory)
//! - EDITOR, VISUAL: editor for `secret edit` (vi)
//! - GPG_AGENT_INFO: passphrase agent endpoint, `socket:pid:protocol`

use crate::paths::Paths;
use std::path::PathBuf;
use thiserror::Error;

pub const ENV_KEY_HOME: &str = "CONSPIRE_HOME";
pub const ENV_VAULT: &str = "CONSPIRACY_VAULT";
pub const ENV_AGENT_INFO: &str = "GPG_AGENT_INFO";

const DEFAULT_EDITOR: &str = "vi";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Couldn't determine home directory - set CONSPIRE_HOME")]
    NoHome,

    #[error("Couldn't determine working directory - set CONSPIRACY_VAULT")]
    NoWorkingDir,
}

/// Resolved configuration for one invocation
#[derive(Debug, Clone)]
pub struct Config {
    pub paths: Paths,
    /// Editor command line, split on whitespace when launched
    pub editor: String,
    /// Raw agent endpoint, when a passphrase agent is configured
    pub agent_info: Option<String>,
    /// Minimal, machine-parseable output
    pub terse: bool,
    /// Report configuration and progress
    pub verbose: bool,
}

impl Config {
    /// Resolve configuration from the real process environment
    pub fn from_env(terse: bool, verbose: bool) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().ok();
        let mut config = Self::from_lookup(
            |name| std::env::var(name).ok(),
            dirs::home_dir(),
            cwd,
        )?;
        config.terse = terse;
        config.verbose = verbose;
        Ok(config)
    }

    /// Resolve configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(
        lookup: F,
        home: Option<PathBuf>,
        cwd: Option<PathBuf>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty variables count as unset
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let key_home = match var(ENV_KEY_HOME) {
            Some(dir) => PathBuf::from(dir),
            None => Paths::default_key_home(&home.ok_or(ConfigError::NoHome)?),
        };

        let vault = match var(ENV_VAULT) {
            Some(dir) => PathBuf::from(dir),
            None => cwd.ok_or(ConfigError::NoWorkingDir)?,
        };

        let editor = var("EDITOR")
            .or_else(|| var("VISUAL"))
            .unwrap_or_else(|| DEFAULT_EDITOR.to_string());

        Ok(Self {
            paths: Paths::new(key_home, vault),
            editor,
            agent_info: var(ENV_AGENT_INFO),
            terse: false,
            verbose: false,
        })
    }

    /// Override the editor (e.g. from `--editor`)
    pub fn with_editor(mut self, editor: Option<String>) -> Self {
        if let Some(editor) = editor.filter(|e| !e.trim().is_empty()) {
            self.editor = editor;
        }
        self
    }

    /// Lines describing the configuration, printed in verbose mode
    pub fn describe(&self) -> Vec<String> {
        vec![
            format!("  Using secret keyring:  {}", self.paths.secret_ring.display()),
            format!("  Using public keyring:  {}", self.paths.public_ring.display()),
            format!("  Using vault directory: {}", self.paths.vault.display()),
            format!("  Using editor:          {}", self.editor),
        ]
    }
}
