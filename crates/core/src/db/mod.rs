//! SQLite persistence for the mapping cache and the name rules.
//!
//! The two stores live in separate files. Both are created lazily on first
//! open. The cache is disposable: if its file is corrupt it is removed and
//! rebuilt empty. The rule store holds administrator configuration, so a
//! corrupt rule file fails initialisation instead.

pub mod busy;
pub mod cache;
pub mod rules;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use tracing::{debug, error, info, warn};

use crate::errors::DatabaseError;

pub use busy::{with_busy_retry, BusyPolicy};
pub use cache::CacheStore;
pub use rules::RuleStore;

pub const CACHE_DB_FILE: &str = "cache.db";
pub const RULES_DB_FILE: &str = "rules.db";

/// What to do when a store file turns out not to be a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnCorrupt {
    Rebuild,
    Fail,
}

/// Open `path`, configure it and bring its schema up to date.
pub(crate) fn open_store(
    path: &Path,
    migrations: schema::Migrations,
    busy: &BusyPolicy,
    on_corrupt: OnCorrupt,
) -> Result<Connection, DatabaseError> {
    info!(store = busy.store, path = %path.display(), "opening store");

    match try_open(path, migrations, busy) {
        Ok(conn) => Ok(conn),
        Err(e) if is_corrupt(&e) && on_corrupt == OnCorrupt::Rebuild => {
            warn!(
                store = busy.store,
                path = %path.display(),
                error = %e,
                "store is corrupt, rebuilding from empty"
            );
            remove_store_files(path)?;
            try_open(path, migrations, busy).map_err(|e| corrupt(busy, path, e))
        }
        Err(e) if is_corrupt(&e) => {
            error!(store = busy.store, path = %path.display(), error = %e, "store is corrupt");
            Err(corrupt(busy, path, e))
        }
        Err(e) => Err(e),
    }
}

/// Open an in-memory store (tests and dry runs).
pub(crate) fn open_memory_store(
    migrations: schema::Migrations,
    busy: &BusyPolicy,
) -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    schema::run_migrations(&conn, migrations)?;
    debug!(store = busy.store, "opened in-memory store");
    Ok(conn)
}

fn try_open(
    path: &Path,
    migrations: schema::Migrations,
    busy: &BusyPolicy,
) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::ZERO)?;
    with_busy_retry(busy, || conn.execute_batch("PRAGMA journal_mode = WAL;"))?;
    with_busy_retry(busy, || schema::run_migrations(&conn, migrations))?;
    debug!(store = busy.store, "store opened with WAL mode");
    Ok(conn)
}

fn is_corrupt(err: &DatabaseError) -> bool {
    match err {
        DatabaseError::SqliteError(e) => matches!(
            e.sqlite_error_code(),
            Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
        ),
        DatabaseError::MigrationFailed { detail, .. } => {
            detail.contains("not a database") || detail.contains("malformed")
        }
        _ => false,
    }
}

fn corrupt(busy: &BusyPolicy, path: &Path, e: DatabaseError) -> DatabaseError {
    DatabaseError::Corrupt {
        store: busy.store.to_string(),
        path: path.display().to_string(),
        detail: e.to_string(),
    }
}

fn remove_store_files(path: &Path) -> Result<(), DatabaseError> {
    let mut sidecars = Vec::new();
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        sidecars.push(std::path::PathBuf::from(name));
    }
    for file in std::iter::once(path.to_path_buf()).chain(sidecars) {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(path = %file.display(), "removed store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_garbage(path: &Path) {
        std::fs::write(path, vec![b'x'; 4096]).unwrap();
    }

    #[test]
    fn test_file_store_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_DB_FILE);
        let policy = BusyPolicy::cache(Duration::from_secs(2));
        let conn = open_store(&path, schema::CACHE_MIGRATIONS, &policy, OnCorrupt::Rebuild).unwrap();
        assert!(path.exists());
        assert_eq!(schema::get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_corrupt_cache_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_DB_FILE);
        write_garbage(&path);

        let policy = BusyPolicy::cache(Duration::from_secs(2));
        let conn = open_store(&path, schema::CACHE_MIGRATIONS, &policy, OnCorrupt::Rebuild).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM idmap_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_corrupt_rule_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RULES_DB_FILE);
        write_garbage(&path);

        let policy = BusyPolicy::rules(Duration::from_secs(2));
        let result = open_store(&path, schema::RULE_MIGRATIONS, &policy, OnCorrupt::Fail);
        assert!(matches!(result, Err(DatabaseError::Corrupt { ref store, .. }) if store == "rules"));
        // The file is left alone for the administrator to inspect.
        assert_eq!(std::fs::read(&path).unwrap().len(), 4096);
    }
}
