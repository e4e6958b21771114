//! Command handlers

pub mod config;
pub mod mirror;
pub mod queue;
pub mod status;

use std::sync::Arc;

use anyhow::{Context, Result};

use dentsync_core::{Config, LocalPersistence, SqlitePersistence};

/// Open the on-disk store the sync core writes to
pub fn open_store(config: &Config) -> Result<Arc<dyn LocalPersistence>> {
    let store = SqlitePersistence::open(config).with_context(|| {
        format!(
            "Failed to open local store at {}",
            config.sqlite_path().display()
        )
    })?;
    Ok(Arc::new(store))
}
