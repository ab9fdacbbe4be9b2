//! conspire - share secrets with a group
//!
//! Commands:
//! - key list [--secret]: Show the public (or private) keyring
//! - key add <RECIPIENT>: Add an age recipient to the public keyring
//! - key import <FILE>: Add an age identity file to the private keyring
//! - group list [GROUP]: Show the members of a group
//! - group add <GROUP> <KEYID>...: Add public-ring keys to a group
//! - group delete <GROUP> <KEYID>...: Remove keys from a group
//! - secret show <NAME>: Decrypt a secret to stdout
//! - secret edit <NAME>: Edit (or create) a secret in $EDITOR
//! - secret recrypt <NAME>: Re-encrypt a secret for the group's current members
//! - version: Show version (and configuration with -v)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conspire::{
    AgeEngine, GroupManager, Imported, KeyStore, PassphraseBroker, SecretStore, DEFAULT_GROUP,
};
use conspire_core::Config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conspire")]
#[command(about = "Share secrets with a group - encrypted per secret, readable by the group's members")]
#[command(after_help = r#"ENVIRONMENT:
    CONSPIRE_HOME      Directory holding secring.asc and pubring.asc (~/.conspire)
    CONSPIRACY_VAULT   Vault directory (current directory)
    EDITOR, VISUAL     Editor for `secret edit` (vi)
    GPG_AGENT_INFO     Ask this passphrase agent instead of the terminal

REVOCATION:
    Removing a key from a group does not change existing secrets.
    Run `conspire secret recrypt <name>` for each secret afterwards."#)]
struct Cli {
    /// Terse (machine-parseable) output
    #[arg(short, long, global = true)]
    terse: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the local keyrings
    #[command(subcommand)]
    Key(KeyCommand),

    /// Manage groups of recipients
    #[command(subcommand)]
    Group(GroupCommand),

    /// Read and write secrets
    #[command(subcommand)]
    Secret(SecretCommand),

    /// Show the version
    Version,
}

#[derive(Subcommand)]
enum KeyCommand {
    /// List the keys in the public keyring
    List {
        /// List the private keyring instead
        #[arg(short, long)]
        secret: bool,
    },

    /// Add an age recipient (age1...) to the public keyring
    Add {
        recipient: String,
        /// Identity to show for the key, e.g. "Name <email>"; repeatable
        #[arg(short, long = "name")]
        names: Vec<String>,
    },

    /// Import an age identity file into the private keyring
    ///
    /// Accepts age-keygen output, or that output protected with
    /// `age -p -a`. A protected file needs its recipient.
    Import {
        file: PathBuf,
        /// Public key of a passphrase-protected identity
        #[arg(short, long)]
        recipient: Option<String>,
        /// Identity to show for the key, e.g. "Name <email>"; repeatable
        #[arg(short, long = "name")]
        names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum GroupCommand {
    /// List the members of a group
    List {
        #[arg(default_value = DEFAULT_GROUP)]
        group: String,
    },

    /// Add keys from the public keyring to a group
    Add {
        group: String,
        /// Key ids, 16 hex characters each
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Delete keys from a group
    Delete {
        group: String,
        /// Key ids, 16 hex characters each
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[derive(Subcommand)]
enum SecretCommand {
    /// Decrypt a secret and print it
    Show { name: String },

    /// Edit the value of a secret, creating it if it doesn't exist
    Edit {
        name: String,
        /// Group to whom the secret will be encrypted
        #[arg(short, long, default_value = DEFAULT_GROUP)]
        group: String,
        /// Editor to use
        #[arg(short, long)]
        editor: Option<String>,
    },

    /// Re-encrypt a secret, e.g. after changing group members
    Recrypt {
        name: String,
        /// Group to whom the secret will be encrypted
        #[arg(short, long, default_value = DEFAULT_GROUP)]
        group: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .without_time()
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config =
        Config::from_env(cli.terse, cli.verbose).context("Couldn't resolve configuration")?;

    match cli.command {
        Commands::Key(command) => {
            let keystore = KeyStore::new(config.paths.clone());
            match command {
                KeyCommand::List { secret } => cmd_key_list(&config, &keystore, secret),
                KeyCommand::Add { recipient, names } => {
                    cmd_key_add(&config, &keystore, &recipient, names)
                }
                KeyCommand::Import {
                    file,
                    recipient,
                    names,
                } => cmd_key_import(&config, &keystore, &file, recipient.as_deref(), names),
            }
        }
        Commands::Group(command) => {
            let keystore = KeyStore::new(config.paths.clone());
            let groups = GroupManager::new(&keystore);
            match command {
                GroupCommand::List { group } => cmd_group_list(&config, &groups, &group),
                GroupCommand::Add { group, keys } => cmd_group_add(&config, &groups, &group, &keys),
                GroupCommand::Delete { group, keys } => {
                    cmd_group_delete(&config, &groups, &group, &keys)
                }
            }
        }
        Commands::Secret(command) => match command {
            SecretCommand::Show { name } => cmd_secret_show(&config, &name),
            SecretCommand::Edit {
                name,
                group,
                editor,
            } => cmd_secret_edit(config.with_editor(editor), &name, &group),
            SecretCommand::Recrypt { name, group } => cmd_secret_recrypt(&config, &name, &group),
        },
        Commands::Version => cmd_version(&config),
    }
}

fn report_config(config: &Config) {
    if config.verbose {
        eprintln!();
        eprintln!("Configuration:");
        for line in config.describe() {
            eprintln!("{}", line);
        }
        eprintln!();
    }
}

fn secret_store(config: &Config) -> Result<SecretStore> {
    let broker = PassphraseBroker::from_config(config)
        .context("Couldn't open passphrase agent even though GPG_AGENT_INFO is set")?;
    Ok(SecretStore::new(
        KeyStore::new(config.paths.clone()),
        AgeEngine::new(),
        broker,
    ))
}

fn cmd_key_list(config: &Config, keystore: &KeyStore, secret: bool) -> Result<()> {
    let keys = if secret {
        keystore.private_ring_or_empty()?
    } else {
        keystore.public_ring_or_empty()?
    };

    if config.terse {
        print!("{}", conspire::display::terse(&keys));
    } else {
        print!("{}", conspire::display::table(&keys));
    }
    Ok(())
}

fn report_import(imported: Imported) {
    match imported {
        Imported::Added(id) => println!("Added key {}", id),
        Imported::AlreadyPresent(id) => println!("Key {} is already in the keyring", id),
    }
}

fn cmd_key_add(
    config: &Config,
    keystore: &KeyStore,
    recipient: &str,
    names: Vec<String>,
) -> Result<()> {
    report_config(config);
    report_import(keystore.import_public(recipient, names)?);
    Ok(())
}

fn cmd_key_import(
    config: &Config,
    keystore: &KeyStore,
    file: &Path,
    recipient: Option<&str>,
    names: Vec<String>,
) -> Result<()> {
    report_config(config);
    let text = zeroize::Zeroizing::new(
        fs::read_to_string(file).with_context(|| format!("Couldn't read {}", file.display()))?,
    );
    let imported = keystore
        .import_private(&text, recipient, names)
        .with_context(|| format!("Couldn't import {}", file.display()))?;
    report_import(imported);
    Ok(())
}

fn cmd_group_list(config: &Config, groups: &GroupManager, group: &str) -> Result<()> {
    let members = groups.list(group)?;

    if config.terse {
        print!("{}", conspire::display::terse(&members));
    } else {
        print!("{}", conspire::display::table(&members));
    }
    Ok(())
}

fn cmd_group_add(
    config: &Config,
    groups: &GroupManager,
    group: &str,
    keys: &[String],
) -> Result<()> {
    report_config(config);
    let outcome = groups.add(group, keys)?;
    println!("Added {} and skipped {}", outcome.added, outcome.skipped);
    Ok(())
}

fn cmd_group_delete(
    config: &Config,
    groups: &GroupManager,
    group: &str,
    keys: &[String],
) -> Result<()> {
    report_config(config);
    let outcome = groups.delete(group, keys)?;
    println!("Deleted {} and skipped {}", outcome.deleted, outcome.skipped);
    Ok(())
}

fn cmd_secret_show(config: &Config, name: &str) -> Result<()> {
    report_config(config);
    let mut store = secret_store(config)?;
    let stdout = io::stdout();
    store
        .show(name, config.verbose, &mut stdout.lock())
        .with_context(|| format!("Couldn't show secret {}", name))?;
    Ok(())
}

fn cmd_secret_edit(config: Config, name: &str, group: &str) -> Result<()> {
    report_config(&config);
    let mut store = secret_store(&config)?;
    store
        .edit(name, group, &config.editor)
        .with_context(|| format!("Couldn't edit secret {}", name))?;
    Ok(())
}

fn cmd_secret_recrypt(config: &Config, name: &str, group: &str) -> Result<()> {
    report_config(config);
    let mut store = secret_store(config)?;
    store
        .recrypt(name, group)
        .with_context(|| format!("Couldn't recrypt secret {}", name))?;
    Ok(())
}

fn cmd_version(config: &Config) -> Result<()> {
    println!("conspire version {}", env!("CARGO_PKG_VERSION"));
    report_config(config);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["conspire", "--help"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_group_list_defaults_to_default_group() {
        let cli = Cli::try_parse_from(["conspire", "group", "list"]).unwrap();
        match cli.command {
            Commands::Group(GroupCommand::List { group }) => assert_eq!(group, "default"),
            _ => panic!("Expected group list"),
        }
    }

    #[test]
    fn test_group_add_parsing() {
        let cli = Cli::try_parse_from([
            "conspire",
            "-t",
            "group",
            "add",
            "ops",
            "4ABEABCDEFCC123B",
            "0123456789ABCDEF",
        ])
        .unwrap();
        assert!(cli.terse);
        match cli.command {
            Commands::Group(GroupCommand::Add { group, keys }) => {
                assert_eq!(group, "ops");
                assert_eq!(keys, vec!["4ABEABCDEFCC123B", "0123456789ABCDEF"]);
            }
            _ => panic!("Expected group add"),
        }
    }

    #[test]
    fn test_group_delete_requires_keys() {
        assert!(Cli::try_parse_from(["conspire", "group", "delete", "ops"]).is_err());
    }

    #[test]
    fn test_secret_edit_parsing() {
        let cli = Cli::try_parse_from([
            "conspire", "secret", "edit", "db-password", "-g", "ops", "-e", "code -w", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Secret(SecretCommand::Edit {
                name,
                group,
                editor,
            }) => {
                assert_eq!(name, "db-password");
                assert_eq!(group, "ops");
                assert_eq!(editor.as_deref(), Some("code -w"));
            }
            _ => panic!("Expected secret edit"),
        }
    }

    #[test]
    fn test_secret_recrypt_defaults() {
        let cli = Cli::try_parse_from(["conspire", "secret", "recrypt", "token"]).unwrap();
        match cli.command {
            Commands::Secret(SecretCommand::Recrypt { name, group }) => {
                assert_eq!(name, "token");
                assert_eq!(group, "default");
            }
            _ => panic!("Expected secret recrypt"),
        }
    }

    #[test]
    fn test_key_import_parsing() {
        let cli = Cli::try_parse_from([
            "conspire",
            "key",
            "import",
            "identity.age",
            "-r",
            "age1recipient",
            "-n",
            "Sherlock Holmes",
            "--name",
            "sherlock@bakerstreet.co.uk",
        ])
        .unwrap();
        match cli.command {
            Commands::Key(KeyCommand::Import {
                file,
                recipient,
                names,
            }) => {
                assert_eq!(file, PathBuf::from("identity.age"));
                assert_eq!(recipient.as_deref(), Some("age1recipient"));
                assert_eq!(names, vec!["Sherlock Holmes", "sherlock@bakerstreet.co.uk"]);
            }
            _ => panic!("Expected key import"),
        }
    }

    #[test]
    fn test_key_list_and_add_parsing() {
        let cli = Cli::try_parse_from(["conspire", "-t", "key", "list", "--secret"]).unwrap();
        assert!(matches!(cli.command, Commands::Key(KeyCommand::List { secret: true })));

        let cli = Cli::try_parse_from(["conspire", "key", "add", "age1abc"]).unwrap();
        match cli.command {
            Commands::Key(KeyCommand::Add { recipient, names }) => {
                assert_eq!(recipient, "age1abc");
                assert!(names.is_empty());
            }
            _ => panic!("Expected key add"),
        }

        assert!(Cli::try_parse_from(["conspire", "key", "add"]).is_err());
    }

    #[test]
    fn test_version_parsing() {
        let cli = Cli::try_parse_from(["conspire", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
    }
}
