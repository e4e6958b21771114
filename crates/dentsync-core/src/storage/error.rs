//! Storage errors
//!
//! Failures of the local key-value store. SQLite and I/O failures are sorted
//! into a few kinds the queue can react to: a full disk or a busy database
//! is worth retrying on the next structural change, a corrupt value is
//! skipped, and the rest is reported.

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode as SqliteCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The database file or its directory is not accessible
    #[error("Permission denied: cannot access '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite or the filesystem ran out of space
    #[error("Disk full while writing the local store")]
    DiskFull,

    /// Another connection holds the database lock
    #[error("Local store is busy")]
    Busy,

    /// The database file itself is damaged
    #[error("Local store is corrupted: {0}")]
    CorruptDatabase(String),

    /// A stored value could not be decoded
    #[error("Stored value for '{key}' is corrupted: {details}")]
    CorruptValue { key: String, details: String },

    #[error("Failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// The store's lock was poisoned by a panicking writer
    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Classify a filesystem error on `path`
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full(&error) => StorageError::DiskFull,
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// Whether the same write may succeed later without user action
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull | StorageError::Busy | StorageError::CorruptValue { .. }
        )
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull => {
                Some("Free up disk space; pending changes are kept in memory until then.")
            }
            StorageError::Busy => Some("Close other dentsync processes using the same data directory."),
            StorageError::PermissionDenied { .. } => {
                Some("Check permissions on the data directory and the dentsync.db file.")
            }
            StorageError::CorruptDatabase(_) => {
                Some("Move dentsync.db aside; it is recreated empty on next start and the mirrors refill from the server.")
            }
            StorageError::CorruptValue { .. } => {
                Some("The cached value will be ignored. Pending changes stored under this key may need to be re-entered.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(SqliteCode::DiskFull) => StorageError::DiskFull,
            Some(SqliteCode::DatabaseBusy) | Some(SqliteCode::DatabaseLocked) => {
                StorageError::Busy
            }
            Some(SqliteCode::DatabaseCorrupt) | Some(SqliteCode::NotADatabase) => {
                StorageError::CorruptDatabase(error.to_string())
            }
            _ => StorageError::Database(error),
        }
    }
}

fn is_disk_full(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left") || msg.contains("quota exceeded")
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_sqlite_classification() {
        let full = StorageError::from(sqlite_failure(rusqlite::ffi::SQLITE_FULL));
        assert!(matches!(full, StorageError::DiskFull));
        assert!(full.is_recoverable());

        let busy = StorageError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(matches!(busy, StorageError::Busy));
        assert!(busy.recovery_suggestion().is_some());

        let corrupt = StorageError::from(sqlite_failure(rusqlite::ffi::SQLITE_NOTADB));
        assert!(matches!(corrupt, StorageError::CorruptDatabase(_)));
        assert!(!corrupt.is_recoverable());

        let other = StorageError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(other, StorageError::Database(_)));
        assert!(other.recovery_suggestion().is_none());
    }

    #[test]
    fn test_io_classification() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(denied, PathBuf::from("/data"));
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(!err.is_recoverable());

        let full = io::Error::new(io::ErrorKind::Other, "No space left on device");
        assert!(matches!(
            StorageError::from_io(full, PathBuf::from("/data")),
            StorageError::DiskFull
        ));
    }

    #[test]
    fn test_corrupt_value_display() {
        let err = StorageError::CorruptValue {
            key: "syncQueue".to_string(),
            details: "expected value at line 1".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("syncQueue"));
        assert!(msg.contains("corrupted"));
        assert!(err.recovery_suggestion().is_some());
    }
}
