//! conspire core - configuration shared by the conspire tools
//!
//! Everything that would otherwise be process-wide state (keyring paths,
//! vault directory, editor, agent endpoint, verbosity) is resolved once
//! into a [`Config`] and handed to each component.

pub mod config;
pub mod paths;

pub use config::{Config, ConfigError};
pub use paths::Paths;
