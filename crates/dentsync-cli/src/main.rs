//! dentsync CLI
//!
//! Command-line interface for inspecting and repairing the local state of
//! the dentsync offline sync core: configuration, the pending mutation queue
//! and the cached entity mirrors.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dentsync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

/// Environment variable holding the log level for both crates
const LOG_LEVEL_ENV: &str = "DENTSYNC_LOG";

#[derive(Parser)]
#[command(name = "dentsync")]
#[command(about = "dentsync - offline sync state of the dental clinic client")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show queue and mirror status
    Status,
    /// Inspect the pending mutation queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
    },
    /// Inspect cached entity mirrors
    Mirror {
        #[command(subcommand)]
        command: Option<MirrorCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (e.g. max_retries, log_file, conflict_policy.appointment)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Print the config file path
    Path,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List pending mutations, oldest first
    #[command(alias = "ls")]
    List,
    /// List mutations that exhausted their retries
    DeadLetters,
    /// Requeue every dead letter with a fresh retry budget
    RetryDead,
    /// Discard every dead letter
    PurgeDead,
}

#[derive(Subcommand)]
enum MirrorCommands {
    /// List cached mirrors
    #[command(alias = "ls")]
    List,
    /// Show the documents of one cached mirror
    Show {
        /// Subscription key (e.g. "appointment[patientId=p1]") or entity name
        key: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work on the file itself and must not need a store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(&config);
    debug!("Using data directory {:?}", config.data_dir);

    let store = commands::open_store(&config)?;

    match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Status => commands::status::show(store, &config, &output),
        Commands::Queue { command } => match command.unwrap_or(QueueCommands::List) {
            QueueCommands::List => commands::queue::list(store, &config, &output),
            QueueCommands::DeadLetters => commands::queue::dead_letters(store, &config, &output),
            QueueCommands::RetryDead => commands::queue::retry_dead(store, &config, &output),
            QueueCommands::PurgeDead => commands::queue::purge_dead(store, &config, &output),
        },
        Commands::Mirror { command } => match command.unwrap_or(MirrorCommands::List) {
            MirrorCommands::List => commands::mirror::list(store.as_ref(), &output),
            MirrorCommands::Show { key } => commands::mirror::show(store.as_ref(), &key, &output),
        },
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
        Some(ConfigCommands::Path) => commands::config::path(config_path, output),
    }
}

/// Initialize logging
///
/// The level comes from DENTSYNC_LOG (default `warn`); RUST_LOG replaces the
/// whole filter when set. Logs go to `log_file` when configured, else stderr.
fn init_logging(config: &Config) {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "warn".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("dentsync_core={},dentsync_cli={}", level, level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let Some(ref log_path) = config.log_file else {
        // Ignore error if already initialized
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dentsync",
            "queue",
            "dead-letters",
            "--json",
            "--config",
            "/tmp/dentsync.toml",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/dentsync.toml")));
        assert!(matches!(
            cli.command,
            Commands::Queue {
                command: Some(QueueCommands::DeadLetters)
            }
        ));
    }

    #[test]
    fn test_parse_mirror_show() {
        let cli = Cli::try_parse_from(["dentsync", "mirror", "show", "service[all]"]).unwrap();
        match cli.command {
            Commands::Mirror {
                command: Some(MirrorCommands::Show { key }),
            } => assert_eq!(key, "service[all]"),
            _ => panic!("expected mirror show"),
        }
    }

    #[test]
    fn test_parse_config_set() {
        let cli = Cli::try_parse_from(["dentsync", "-q", "config", "set", "max_retries", "3"])
            .unwrap();
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: Some(ConfigCommands::Set { .. })
            }
        ));
    }
}
