//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/dentsync/config.toml)
//! 3. Environment variables (DENTSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::EntityType;
use crate::resolver::{ConflictPolicy, ConflictResolver};

/// Environment variable prefix
const ENV_PREFIX: &str = "DENTSYNC";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite db)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between opportunistic flushes while online
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Maximum mutations written per flush
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    /// Transient failures tolerated before a mutation is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum queued mutations; the oldest is dropped on overflow
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// First retry delay after a transient failure
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Conflict policy per entity type (entity name → policy)
    #[serde(default)]
    pub conflict_policies: BTreeMap<String, ConflictPolicy>,

    /// Log file path (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            flush_interval_secs: default_flush_interval_secs(),
            flush_batch_size: default_flush_batch_size(),
            max_retries: default_max_retries(),
            queue_capacity: default_queue_capacity(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            conflict_policies: BTreeMap::new(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DENTSYNC_DATA_DIR, DENTSYNC_FLUSH_INTERVAL_SECS, ...)
    /// 2. Config file (~/.config/dentsync/config.toml or DENTSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // DENTSYNC_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // DENTSYNC_FLUSH_INTERVAL_SECS
        if let Ok(val) = std::env::var(format!("{}_FLUSH_INTERVAL_SECS", ENV_PREFIX)) {
            match val.parse() {
                Ok(secs) => self.flush_interval_secs = secs,
                Err(_) => warn!("Ignoring invalid {}_FLUSH_INTERVAL_SECS: {}", ENV_PREFIX, val),
            }
        }

        // DENTSYNC_MAX_RETRIES
        if let Ok(val) = std::env::var(format!("{}_MAX_RETRIES", ENV_PREFIX)) {
            match val.parse() {
                Ok(retries) => self.max_retries = retries,
                Err(_) => warn!("Ignoring invalid {}_MAX_RETRIES: {}", ENV_PREFIX, val),
            }
        }

        // DENTSYNC_LOG_FILE
        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DENTSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dentsync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("dentsync.db")
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms.max(self.initial_retry_delay_ms))
    }

    /// Build the conflict resolver from the configured policies
    ///
    /// Unknown entity names are logged and skipped.
    pub fn resolver(&self) -> ConflictResolver {
        let mut resolver = ConflictResolver::new();
        for (name, policy) in &self.conflict_policies {
            match name.parse::<EntityType>() {
                Ok(entity) => resolver.set_policy(entity, *policy),
                Err(e) => warn!("Ignoring conflict policy: {}", e),
            }
        }
        resolver
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dentsync")
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_flush_batch_size() -> usize {
    25
}

fn default_max_retries() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_initial_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "DENTSYNC_DATA_DIR",
        "DENTSYNC_FLUSH_INTERVAL_SECS",
        "DENTSYNC_MAX_RETRIES",
        "DENTSYNC_LOG_FILE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.flush_interval_secs, 5);
        assert_eq!(config.flush_batch_size, 25);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.initial_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.max_retry_delay(), Duration::from_secs(30));
        assert!(config.log_file.is_none());
        assert!(config.data_dir.ends_with("dentsync"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.sqlite_path().ends_with("dentsync.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DENTSYNC_DATA_DIR", "/tmp/dentsync-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/dentsync-test"));
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DENTSYNC_FLUSH_INTERVAL_SECS", "30");
        env::set_var("DENTSYNC_MAX_RETRIES", "2");
        config.apply_env_overrides();
        assert_eq!(config.flush_interval_secs, 30);
        assert_eq!(config.max_retries, 2);

        // Invalid values leave the previous setting
        env::set_var("DENTSYNC_MAX_RETRIES", "lots");
        config.apply_env_overrides();
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_env_override_log_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("DENTSYNC_LOG_FILE", "/tmp/dentsync.log");
        config.apply_env_overrides();
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/dentsync.log")));

        // Empty string clears it
        env::set_var("DENTSYNC_LOG_FILE", "");
        config.apply_env_overrides();
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config {
            data_dir: PathBuf::from("/data/dentsync"),
            flush_batch_size: 10,
            ..Config::default()
        };
        config
            .conflict_policies
            .insert("appointment".to_string(), ConflictPolicy::Merge);

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("flush_batch_size"));
        assert!(toml_str.contains("merge"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.flush_batch_size, 10);
        assert_eq!(
            parsed.conflict_policies.get("appointment"),
            Some(&ConflictPolicy::Merge)
        );
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            max_retries = 3

            [conflict_policies]
            appointment = "latest-timestamp"
            payment = "client-wins"
            invoice = "merge"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.flush_interval_secs, 5);

        let resolver = config.resolver();
        assert_eq!(
            resolver.policy_for(EntityType::Appointment),
            ConflictPolicy::LatestTimestamp
        );
        assert_eq!(
            resolver.policy_for(EntityType::Payment),
            ConflictPolicy::ClientWins
        );
        assert_eq!(
            resolver.policy_for(EntityType::Service),
            ConflictPolicy::ServerWins
        );
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        env::set_var("DENTSYNC_DATA_DIR", temp_dir.path().join("data"));

        let path = temp_dir.path().join("missing.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.max_retries, 5);
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            queue_capacity: 50,
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_with_cli_override(Some(&path)).unwrap();
        assert_eq!(loaded.queue_capacity, 50);
        assert_eq!(loaded.data_dir, temp_dir.path().join("data"));
    }
}
