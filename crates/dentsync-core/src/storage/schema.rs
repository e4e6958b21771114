//! SQLite schema for the key-value store
//!
//! Versions are tracked with `PRAGMA user_version`; each entry of
//! [`MIGRATIONS`] moves the database one version forward.

use rusqlite::{Connection, Result};

/// Migrations in order; the database is at version `i + 1` after `MIGRATIONS[i]`
const MIGRATIONS: &[&str] = &[
    // 1: durable values keyed by name
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
    "#,
];

/// Schema version this build writes
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Version recorded in the database (0 for a fresh file)
pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Bring the database up to [`SCHEMA_VERSION`]
///
/// Returns the number of migrations applied. A database written by a newer
/// build is left untouched.
pub fn migrate(conn: &Connection) -> Result<usize> {
    let current = schema_version(conn)?.max(0) as usize;
    let pending = MIGRATIONS.iter().enumerate().skip(current);

    let mut applied = 0;
    for (index, sql) in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (index + 1) as i32)?;
        tx.commit()?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrate_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);

        assert_eq!(migrate(&conn).unwrap(), MIGRATIONS.len());
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(tables(&conn).contains(&"kv".to_string()));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(migrate(&conn).unwrap(), 0);
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_database_left_alone() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 3)
            .unwrap();

        assert_eq!(migrate(&conn).unwrap(), 0);
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION + 3);
    }
}
