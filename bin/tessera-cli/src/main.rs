//! Tessera CLI - Data directory administration
//!
//! Opens a data directory (running recovery first), then manages partitions
//! and per-partition credentials.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tessera_common::EngineConfig;
use tessera_storage::{Engine, Permissions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tessera-cli")]
#[command(about = "Tessera Admin CLI")]
#[command(version)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration file)
    #[arg(short, long, env = "TESSERA_DATA_PATH")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run recovery and print what it did
    Recover,
    /// Partition operations
    Partition {
        #[command(subcommand)]
        action: PartitionCommands,
    },
    /// User operations
    User {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// API key operations
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PartitionCommands {
    /// List all partitions
    List,
    /// Create a partition
    Create {
        /// Partition name
        name: String,
    },
    /// Delete a partition and everything in it
    Delete {
        /// Partition name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    /// List users of a partition
    List {
        /// Partition name
        partition: String,
    },
    /// Show a user's permissions and API keys
    Show {
        /// Partition name
        partition: String,
        /// Username
        username: String,
    },
    /// Replace a user's permissions, creating the user if needed
    Grant {
        /// Partition name
        partition: String,
        /// Username
        username: String,
        /// Permissions to hold
        permissions: Vec<String>,
    },
    /// Delete a user and all of their API keys
    Delete {
        /// Partition name
        partition: String,
        /// Username
        username: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    /// Bind an API key to a user
    Create {
        /// Partition name
        partition: String,
        /// Username
        username: String,
        /// API key
        api_key: String,
    },
    /// Show the owner and permissions of an API key
    Show {
        /// Partition name
        partition: String,
        /// API key
        api_key: String,
    },
    /// Delete an API key
    Delete {
        /// Partition name
        partition: String,
        /// API key
        api_key: String,
    },
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(".tessera")
        .join("data")
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::with_data_dir(default_data_dir()));
    };
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn format_permissions(permissions: &Permissions) -> String {
    if permissions.is_empty() {
        return "(none)".to_string();
    }
    permissions
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    info!("Using data directory {:?}", config.data_dir);

    let data_dir = config.data_dir.clone();
    let engine = Engine::open(config)
        .with_context(|| format!("failed to open data directory {}", data_dir.display()))?;

    match args.command {
        Commands::Recover => {
            let report = engine.recovery_report();
            println!("Recovery");
            println!("========");
            println!("Discarded transactions: {}", report.discarded);
            println!("Replayed transactions:  {}", report.replayed);
            println!("Repaired safe writes:   {}", report.repaired);
        }
        Commands::Partition { action } => match action {
            PartitionCommands::List => {
                let partitions = engine.partitions()?;
                println!("Partitions");
                println!("==========");
                if partitions.is_empty() {
                    println!("(none)");
                }
                for name in partitions {
                    println!("{name}");
                }
            }
            PartitionCommands::Create { name } => {
                engine.create_partition(&name)?;
                println!("Created partition: {name}");
            }
            PartitionCommands::Delete { name } => {
                engine.delete_partition(&name)?;
                println!("Deleted partition: {name}");
            }
        },
        Commands::User { action } => match action {
            UserCommands::List { partition } => {
                let users = engine.usernames(&partition)?;
                println!("Users in {partition}");
                println!("=========");
                if users.is_empty() {
                    println!("(none)");
                }
                for user in users {
                    println!("{user}");
                }
            }
            UserCommands::Show {
                partition,
                username,
            } => {
                let permissions = engine.permissions_by_username(&partition, &username)?;
                let keys = engine.api_keys(&partition, &username)?;
                println!("User: {username}");
                println!("Permissions: {}", format_permissions(&permissions));
                println!("API keys: {}", keys.len());
                for key in keys {
                    println!("  {key}");
                }
            }
            UserCommands::Grant {
                partition,
                username,
                permissions,
            } => {
                let permissions: Permissions = permissions.into_iter().collect();
                engine.set_permissions(&partition, &username, permissions.clone())?;
                println!(
                    "Set permissions of {username}: {}",
                    format_permissions(&permissions)
                );
            }
            UserCommands::Delete {
                partition,
                username,
            } => {
                engine.delete_username(&partition, &username)?;
                println!("Deleted user: {username}");
            }
        },
        Commands::Key { action } => match action {
            KeyCommands::Create {
                partition,
                username,
                api_key,
            } => {
                engine.create_api_key(&partition, &username, &api_key)?;
                println!("Bound API key to {username}");
            }
            KeyCommands::Show { partition, api_key } => {
                let (username, permissions) = engine.permissions_by_api_key(&partition, &api_key)?;
                println!("Owner: {username}");
                println!("Permissions: {}", format_permissions(&permissions));
            }
            KeyCommands::Delete { partition, api_key } => {
                engine.delete_api_key(&partition, &api_key)?;
                println!("Deleted API key");
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/tessera\"\nsync = \"never\"\n\n[cache]\nmax_bytes = 1024\n",
        )
        .unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/tessera"));
        assert_eq!(config.cache.max_bytes, 1024);
        assert!(config.cache.enabled);

        std::fs::write(&path, "sync = 3").unwrap();
        assert!(load_config(Some(path.as_path())).is_err());
    }

    #[test]
    fn test_default_data_dir() {
        assert!(default_data_dir().ends_with(".tessera/data"));
    }
}
