//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use dentsync_core::{Config, ConflictPolicy, EntityType};

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, flush_interval_secs, flush_batch_size, max_retries, \
     queue_capacity, initial_retry_delay_ms, max_retry_delay_ms, log_file, \
     conflict_policy.<entity>";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.print_json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = effective_path(config_path);
            println!("Configuration:");
            println!("  data_dir:               {}", config.data_dir.display());
            println!("  flush_interval_secs:    {}", config.flush_interval_secs);
            println!("  flush_batch_size:       {}", config.flush_batch_size);
            println!("  max_retries:            {}", config.max_retries);
            println!("  queue_capacity:         {}", config.queue_capacity);
            println!("  initial_retry_delay_ms: {}", config.initial_retry_delay_ms);
            println!("  max_retry_delay_ms:     {}", config.max_retry_delay_ms);
            println!(
                "  log_file:               {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  conflict policies:");
            let resolver = config.resolver();
            for entity in EntityType::ALL {
                println!("    {:<13} {}", entity.as_str(), resolver.policy_for(entity));
            }
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply_setting(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = effective_path(config_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

/// Print the config file in use
pub fn path(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let path = effective_path(config_path);
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({"path": path, "exists": path.exists()})
            );
        }
        OutputFormat::Human | OutputFormat::Quiet => println!("{}", path.display()),
    }
    Ok(())
}

fn effective_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path)
}

/// Update one field of `config` from its textual form
fn apply_setting(config: &mut Config, key: &str, value: &str) -> Result<()> {
    if let Some(entity) = key.strip_prefix("conflict_policy.") {
        let entity: EntityType = entity.parse()?;
        if value.is_empty() || value == "none" {
            config.conflict_policies.remove(entity.as_str());
        } else {
            let policy: ConflictPolicy = value.parse().map_err(anyhow::Error::msg)?;
            config
                .conflict_policies
                .insert(entity.as_str().to_string(), policy);
        }
        return Ok(());
    }

    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "flush_interval_secs" => {
            config.flush_interval_secs = parse_number(key, value)?;
        }
        "flush_batch_size" => {
            config.flush_batch_size = parse_number(key, value)?;
        }
        "max_retries" => {
            config.max_retries = parse_number(key, value)?;
        }
        "queue_capacity" => {
            config.queue_capacity = parse_number(key, value)?;
        }
        "initial_retry_delay_ms" => {
            config.initial_retry_delay_ms = parse_number(key, value)?;
        }
        "max_retry_delay_ms" => {
            config.max_retry_delay_ms = parse_number(key, value)?;
        }
        "log_file" => {
            config.log_file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.into())
            };
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    match value.parse() {
        Ok(n) => Ok(n),
        Err(_) => bail!("Invalid value for {}: '{}' is not a number", key, value),
    }
}
