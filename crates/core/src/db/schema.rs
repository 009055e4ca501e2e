//! Schema definitions and migration runner for the two stores.
//!
//! The cache store and the rule store are separate SQLite files with
//! independent migration lists. The `user_version` pragma tracks which
//! migrations have already been applied to each file.

use rusqlite::Connection;
use tracing::{debug, info};

use super::busy::BusyError;
use crate::errors::DatabaseError;

/// A migration list. Each entry is `(version, description, sql)`; versions
/// start at 1.
pub type Migrations = &'static [(u32, &'static str, &'static str)];

/// Mapping cache: id mappings and name lookups, both with expirations.
///
/// A cleared direction flag is stored as NULL, never 0, so the unique
/// indexes only constrain rows that are valid in that direction.
pub static CACHE_MIGRATIONS: Migrations = &[
    (
        1,
        "initial cache schema",
        r#"
        CREATE TABLE IF NOT EXISTS idmap_cache (
            sidprefix   TEXT,
            rid         INTEGER,
            windomain   TEXT,
            winname     TEXT,
            pid         INTEGER,
            unixname    TEXT,
            is_user     INTEGER,
            w2u         INTEGER,
            u2w         INTEGER,
            expiration  INTEGER
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idmap_cache_sid_w2u
            ON idmap_cache (sidprefix, rid, w2u);
        CREATE UNIQUE INDEX IF NOT EXISTS idmap_cache_pid_u2w
            ON idmap_cache (pid, is_user, u2w);

        CREATE TABLE IF NOT EXISTS name_cache (
            sidprefix   TEXT,
            rid         INTEGER,
            name        TEXT,
            domain      TEXT,
            type        INTEGER,
            expiration  INTEGER
        );

        CREATE UNIQUE INDEX IF NOT EXISTS name_cache_sid
            ON name_cache (sidprefix, rid);
        "#,
    ),
    (
        2,
        "index name cache by name",
        r#"
        CREATE INDEX IF NOT EXISTS name_cache_name ON name_cache (name, domain);
        "#,
    ),
];

/// Administrator-maintained name rules.
pub static RULE_MIGRATIONS: Migrations = &[
    (
        1,
        "initial rule schema",
        r#"
        CREATE TABLE IF NOT EXISTS namerules (
            is_user     INTEGER NOT NULL,
            windomain   TEXT,
            winname     TEXT NOT NULL,
            is_nt4      INTEGER NOT NULL,
            unixname    TEXT NOT NULL,
            w2u_order   INTEGER,
            u2w_order   INTEGER
        );

        CREATE UNIQUE INDEX IF NOT EXISTS namerules_w2u
            ON namerules (winname, windomain, is_user, w2u_order);
        CREATE UNIQUE INDEX IF NOT EXISTS namerules_u2w
            ON namerules (unixname, is_user, u2w_order);
        "#,
    ),
    (
        2,
        "windows names in rules are unique regardless of case",
        r#"
        DELETE FROM namerules
         WHERE w2u_order IS NOT NULL
           AND rowid NOT IN (
               SELECT MIN(rowid) FROM namerules
                WHERE w2u_order IS NOT NULL
                GROUP BY winname COLLATE NOCASE, windomain COLLATE NOCASE,
                         is_user, w2u_order
           );

        DROP INDEX IF EXISTS namerules_w2u;
        CREATE UNIQUE INDEX namerules_w2u
            ON namerules (winname COLLATE NOCASE, windomain COLLATE NOCASE,
                          is_user, w2u_order);
        "#,
    ),
];

/// Run all pending migrations from `migrations` against `conn`.
pub fn run_migrations(conn: &Connection, migrations: Migrations) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    debug!(
        current_version,
        target_version = migrations.last().map(|m| m.0).unwrap_or(0),
        "checking store migrations"
    );

    for &(version, description, sql) in migrations {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql).map_err(|e| {
                // Contention is retried by the caller, not a failed migration.
                if e.is_busy() {
                    DatabaseError::SqliteError(e)
                } else {
                    DatabaseError::MigrationFailed {
                        version,
                        detail: e.to_string(),
                    }
                }
            })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_cache_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, CACHE_MIGRATIONS).unwrap();
        run_migrations(&conn, CACHE_MIGRATIONS).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
        assert_eq!(tables(&conn), vec!["idmap_cache", "name_cache"]);
    }

    #[test]
    fn test_rule_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, RULE_MIGRATIONS).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
        assert_eq!(tables(&conn), vec!["namerules"]);
    }

    #[test]
    fn test_rule_upgrade_drops_case_duplicates() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, &RULE_MIGRATIONS[..1]).unwrap();
        conn.execute_batch(
            "INSERT INTO namerules VALUES (1, 'CORP', 'Alice', 0, 'alice', 2, NULL);
             INSERT INTO namerules VALUES (1, 'corp', 'alice', 0, 'al', 2, NULL);
             INSERT INTO namerules VALUES (1, 'CORP', 'bob', 0, 'bob', NULL, 2);",
        )
        .unwrap();

        run_migrations(&conn, RULE_MIGRATIONS).unwrap();
        let unixnames: Vec<String> = conn
            .prepare("SELECT unixname FROM namerules ORDER BY rowid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(unixnames, vec!["alice", "bob"]);

        let dup = conn.execute(
            "INSERT INTO namerules VALUES (1, 'Corp', 'ALICE', 0, 'x', 2, NULL)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_null_direction_does_not_collide() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, CACHE_MIGRATIONS).unwrap();
        // Two rows for the same SID with the w2u flag cleared are allowed.
        for pid in [2147483650i64, 2147483651] {
            conn.execute(
                "INSERT INTO idmap_cache (sidprefix, rid, pid, is_user, w2u, u2w)
                 VALUES ('S-1-5-21-1-2-3', 500, ?1, 1, NULL, 1)",
                rusqlite::params![pid],
            )
            .unwrap();
        }
        let dup = conn.execute(
            "INSERT INTO idmap_cache (sidprefix, rid, pid, is_user, w2u, u2w)
             VALUES ('S-1-5-21-1-2-3', 500, 7, 1, 1, NULL)",
            [],
        );
        assert!(dup.is_ok());
        let dup = conn.execute(
            "INSERT INTO idmap_cache (sidprefix, rid, pid, is_user, w2u, u2w)
             VALUES ('S-1-5-21-1-2-3', 500, 8, 1, 1, NULL)",
            [],
        );
        assert!(dup.is_err());
    }
}
