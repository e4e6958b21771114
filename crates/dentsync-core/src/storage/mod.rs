//! Storage layer
//!
//! Handles durable key-value persistence for the sync queue and mirror
//! caches.
//!
//! ## Keys
//!
//! - `syncQueue` - pending mutations, FIFO
//! - `syncDeadLetters` - mutations that exhausted their retries
//! - `mirror:<entity>:<scope>` - last resolved view of one subscription

pub mod error;
pub mod persistence;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use persistence::{load_json, save_json, LocalPersistence, MemoryPersistence, SqlitePersistence};
pub use schema::{migrate, schema_version, SCHEMA_VERSION};
