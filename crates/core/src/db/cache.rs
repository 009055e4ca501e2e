//! Mapping cache: SID to id rows and SID to name rows, both with TTLs.
//!
//! Every lookup samples "now" once and compares with `expiration > now`, so a
//! row whose expiration equals the current second is already stale. Rows with
//! an expiration of 0 or NULL never expire. Rows holding an ephemeral id are
//! returned even when stale; the caller decides whether to revalidate them.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::busy::{with_busy_retry, BusyPolicy};
use super::{open_memory_store, open_store, schema, OnCorrupt};
use crate::errors::{DatabaseError, MapError};
use crate::models::{is_ephemeral, Direction, IdKind, IdType, NameType, EPHEMERAL_MIN};
use crate::sid::Sid;

/// Stored for rows that must never expire. Distinct from 0, which means
/// "no expiration recorded".
pub const NO_EXPIRE: i64 = i64::MAX;

/// When a cache row stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Unix timestamp, in seconds.
    At(i64),
    Never,
}

impl Expiry {
    pub fn after(now: i64, ttl_secs: u64) -> Self {
        Expiry::At(now.saturating_add(ttl_secs as i64))
    }

    fn as_db(self) -> i64 {
        match self {
            Expiry::At(ts) => ts,
            Expiry::Never => NO_EXPIRE,
        }
    }
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn flag(set: bool) -> Option<i64> {
    if set {
        Some(1)
    } else {
        None
    }
}

fn flag_is_set(v: Option<i64>) -> bool {
    matches!(v, Some(n) if n != 0)
}

/// Values for one `idmap_cache` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    pub sid: Sid,
    pub windomain: Option<String>,
    pub winname: Option<String>,
    pub kind: IdKind,
    pub pid: u32,
    pub unixname: Option<String>,
    pub direction: Direction,
    pub expiry: Expiry,
}

/// SID to id cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedId {
    pub kind: IdKind,
    pub id: u32,
    pub direction: Direction,
    pub unixname: Option<String>,
    /// Ephemeral id whose row is past its expiration.
    pub expired: bool,
}

impl CachedId {
    /// Check the cached kind against the requested id type.
    pub fn check_kind(&self, wanted: IdType) -> Result<(), MapError> {
        match (wanted, self.kind) {
            (IdType::Uid, IdKind::Gid) => Err(MapError::NotUser),
            (IdType::Gid, IdKind::Uid) => Err(MapError::NotGroup),
            (IdType::Sid, _) => Err(MapError::Unsupported("SID requested from id cache".into())),
            _ => Ok(()),
        }
    }
}

/// Id to SID cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSid {
    pub sid: Sid,
    pub direction: Direction,
    pub winname: Option<String>,
    pub windomain: Option<String>,
}

/// Name cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedName {
    pub name: String,
    pub domain: Option<String>,
    pub name_type: NameType,
}

/// A raw `idmap_cache` row, for administrative listings.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub sid: Sid,
    pub windomain: Option<String>,
    pub winname: Option<String>,
    pub pid: u32,
    pub unixname: Option<String>,
    pub is_user: bool,
    pub w2u: bool,
    pub u2w: bool,
    pub expiration: Option<i64>,
}

/// Per-worker handle on the mapping cache.
pub struct CacheStore {
    conn: Connection,
    busy: BusyPolicy,
}

impl CacheStore {
    /// Open (or create) the cache at `path`, rebuilding it if corrupt.
    pub fn open<P: AsRef<Path>>(path: P, busy: BusyPolicy) -> Result<Self, DatabaseError> {
        let conn = open_store(path.as_ref(), schema::CACHE_MIGRATIONS, &busy, OnCorrupt::Rebuild)?;
        Ok(Self { conn, busy })
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        let busy = BusyPolicy::cache(std::time::Duration::from_secs(2));
        let conn = open_memory_store(schema::CACHE_MIGRATIONS, &busy)?;
        Ok(Self { conn, busy })
    }

    // -- idmap_cache --------------------------------------------------------

    pub fn lookup_id_by_sid(&self, sid: &Sid, wanted: IdType) -> Result<CachedId, MapError> {
        self.lookup_id_by_sid_at(sid, wanted, now_ts())
    }

    /// Find the id a SID maps to in the windows-to-unix direction.
    pub fn lookup_id_by_sid_at(
        &self,
        sid: &Sid,
        wanted: IdType,
        now: i64,
    ) -> Result<CachedId, MapError> {
        type Row = (Option<i64>, Option<i64>, Option<i64>, Option<String>, Option<i64>);
        let row: Option<Row> = with_busy_retry(&self.busy, || {
            self.conn
                .query_row(
                    "SELECT pid, is_user, expiration, unixname, u2w FROM idmap_cache
                     WHERE w2u = 1 AND sidprefix = ?1 AND rid = ?2
                       AND (pid >= ?3 OR expiration = 0 OR expiration IS NULL
                            OR expiration > ?4)",
                    params![sid.prefix, sid.rid, EPHEMERAL_MIN, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()
        })?;

        let Some((pid, is_user, expiration, unixname, u2w)) = row else {
            return Err(MapError::NotFound);
        };
        let pid = pid_column(pid, "idmap_cache.pid")?;
        let is_user = is_user.ok_or_else(|| MapError::CacheCorrupt("idmap_cache.is_user".into()))?;
        let kind = IdKind::from_is_user(is_user != 0);

        let expired = is_ephemeral(pid)
            && matches!(expiration, Some(exp) if exp != 0 && exp != NO_EXPIRE && exp <= now);

        let direction = if flag_is_set(u2w) {
            Direction::Bi
        } else {
            Direction::W2u
        };
        let hit = CachedId {
            kind,
            id: pid,
            direction,
            unixname,
            expired,
        };
        // An expired row is handed back whatever its kind; the caller either
        // keeps it as a fallback or checks the kind itself.
        if !expired {
            hit.check_kind(wanted)?;
        }
        debug!(%sid, %kind, pid, expired, "id cache hit");
        Ok(hit)
    }

    pub fn lookup_sid_by_id(&self, kind: IdKind, id: u32) -> Result<CachedSid, MapError> {
        self.lookup_sid_by_id_at(kind, id, now_ts())
    }

    /// Find the SID an id maps to in the unix-to-windows direction.
    pub fn lookup_sid_by_id_at(
        &self,
        kind: IdKind,
        id: u32,
        now: i64,
    ) -> Result<CachedSid, MapError> {
        type Row = (Option<String>, Option<i64>, Option<String>, Option<String>, Option<i64>);
        let row: Option<Row> = with_busy_retry(&self.busy, || {
            self.conn
                .query_row(
                    "SELECT sidprefix, rid, winname, windomain, w2u FROM idmap_cache
                     WHERE u2w = 1 AND pid = ?1 AND is_user = ?2
                       AND (pid >= ?3 OR expiration = 0 OR expiration IS NULL
                            OR expiration > ?4)",
                    params![id, kind.is_user(), EPHEMERAL_MIN, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()
        })?;

        let Some((prefix, rid, winname, windomain, w2u)) = row else {
            return Err(MapError::NotFound);
        };
        let sid = sid_columns(prefix, rid)?;
        let direction = if flag_is_set(w2u) {
            Direction::Bi
        } else {
            Direction::U2w
        };
        debug!(%kind, id, %sid, "sid cache hit");
        Ok(CachedSid {
            sid,
            direction,
            winname,
            windomain,
        })
    }

    /// Insert or replace an id mapping row.
    pub fn upsert_id_mapping(&self, mapping: &IdMapping) -> Result<(), MapError> {
        let w2u = flag(matches!(mapping.direction, Direction::Bi | Direction::W2u));
        let u2w = flag(matches!(mapping.direction, Direction::Bi | Direction::U2w));
        with_busy_retry(&self.busy, || {
            self.conn.execute(
                "INSERT OR REPLACE INTO idmap_cache
                    (sidprefix, rid, windomain, winname, pid, unixname, is_user,
                     expiration, w2u, u2w)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    mapping.sid.prefix,
                    mapping.sid.rid,
                    mapping.windomain,
                    mapping.winname,
                    mapping.pid,
                    mapping.unixname,
                    mapping.kind.is_user(),
                    mapping.expiry.as_db(),
                    w2u,
                    u2w,
                ],
            )
        })?;
        debug!(
            sid = %mapping.sid,
            kind = %mapping.kind,
            pid = mapping.pid,
            direction = %mapping.direction,
            "cached id mapping"
        );
        Ok(())
    }

    /// Stop returning a superseded ephemeral id for `sid`. The row stays in
    /// place so the id still maps back to the SID.
    pub fn invalidate_reverse_direction(&self, sid: &Sid, kind: IdKind) -> Result<usize, MapError> {
        let n = with_busy_retry(&self.busy, || {
            self.conn.execute(
                "UPDATE idmap_cache SET w2u = NULL
                 WHERE sidprefix = ?1 AND rid = ?2 AND w2u = 1 AND pid >= ?3 AND is_user = ?4",
                params![sid.prefix, sid.rid, EPHEMERAL_MIN, kind.is_user()],
            )
        })?;
        debug!(%sid, %kind, rows = n, "invalidated ephemeral mapping");
        Ok(n)
    }

    // -- name_cache ---------------------------------------------------------

    pub fn lookup_name_by_sid(&self, sid: &Sid) -> Result<CachedName, MapError> {
        self.lookup_name_by_sid_at(sid, now_ts())
    }

    pub fn lookup_name_by_sid_at(&self, sid: &Sid, now: i64) -> Result<CachedName, MapError> {
        type Row = (Option<String>, Option<String>, Option<i64>);
        let row: Option<Row> = with_busy_retry(&self.busy, || {
            self.conn
                .query_row(
                    "SELECT name, domain, type FROM name_cache
                     WHERE sidprefix = ?1 AND rid = ?2
                       AND (expiration = 0 OR expiration IS NULL OR expiration > ?3)",
                    params![sid.prefix, sid.rid, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
        })?;

        let Some((name, domain, name_type)) = row else {
            return Err(MapError::NotFound);
        };
        let name = name.ok_or_else(|| MapError::CacheCorrupt("name_cache.name".into()))?;
        let name_type = name_type
            .and_then(NameType::from_db)
            .ok_or_else(|| MapError::CacheCorrupt("name_cache.type".into()))?;
        Ok(CachedName {
            name,
            domain,
            name_type,
        })
    }

    pub fn lookup_sid_by_name(
        &self,
        name: &str,
        domain: Option<&str>,
    ) -> Result<(Sid, NameType), MapError> {
        self.lookup_sid_by_name_at(name, domain, now_ts())
    }

    /// Windows names compare case-insensitively. Without a domain any cached
    /// domain matches.
    pub fn lookup_sid_by_name_at(
        &self,
        name: &str,
        domain: Option<&str>,
        now: i64,
    ) -> Result<(Sid, NameType), MapError> {
        type Row = (Option<String>, Option<i64>, Option<i64>);
        let row: Option<Row> = with_busy_retry(&self.busy, || {
            self.conn
                .query_row(
                    "SELECT sidprefix, rid, type FROM name_cache
                     WHERE name = ?1 COLLATE NOCASE
                       AND (?2 IS NULL OR domain = ?2 COLLATE NOCASE)
                       AND (expiration = 0 OR expiration IS NULL OR expiration > ?3)",
                    params![name, domain, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
        })?;

        let Some((prefix, rid, name_type)) = row else {
            return Err(MapError::NotFound);
        };
        let sid = sid_columns(prefix, rid)?;
        let name_type = name_type
            .and_then(NameType::from_db)
            .ok_or_else(|| MapError::CacheCorrupt("name_cache.type".into()))?;
        Ok((sid, name_type))
    }

    /// Insert or replace the cached name of a SID.
    pub fn upsert_name_mapping(
        &self,
        sid: &Sid,
        name: &str,
        domain: Option<&str>,
        name_type: NameType,
        expiry: Expiry,
    ) -> Result<(), MapError> {
        with_busy_retry(&self.busy, || {
            self.conn.execute(
                "INSERT OR REPLACE INTO name_cache (sidprefix, rid, name, domain, type, expiration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![sid.prefix, sid.rid, name, domain, name_type.as_db(), expiry.as_db()],
            )
        })?;
        debug!(%sid, name, "cached name mapping");
        Ok(())
    }

    // -- administration -----------------------------------------------------

    /// Return up to `limit` id mapping rows, most recently written first.
    pub fn list_id_mappings(&self, limit: u32) -> Result<Vec<CacheRow>, MapError> {
        let rows = with_busy_retry(&self.busy, || {
            let mut stmt = self.conn.prepare(
                "SELECT sidprefix, rid, windomain, winname, pid, unixname, is_user,
                        w2u, u2w, expiration
                 FROM idmap_cache ORDER BY rowid DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                        row.get::<_, Option<i64>>(9)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })?;

        rows.into_iter()
            .map(
                |(prefix, rid, windomain, winname, pid, unixname, is_user, w2u, u2w, expiration)| {
                    Ok(CacheRow {
                        sid: sid_columns(prefix, rid)?,
                        windomain,
                        winname,
                        pid: pid_column(pid, "idmap_cache.pid")?,
                        unixname,
                        is_user: flag_is_set(is_user),
                        w2u: flag_is_set(w2u),
                        u2w: flag_is_set(u2w),
                        expiration,
                    })
                },
            )
            .collect()
    }

    pub fn purge_expired(&self) -> Result<usize, MapError> {
        self.purge_expired_at(now_ts())
    }

    /// Delete rows that expired at or before `now`. Ephemeral id rows are
    /// kept so their ids are never handed to another SID.
    pub fn purge_expired_at(&self, now: i64) -> Result<usize, MapError> {
        let ids = with_busy_retry(&self.busy, || {
            self.conn.execute(
                "DELETE FROM idmap_cache
                 WHERE expiration IS NOT NULL AND expiration != 0 AND expiration <= ?1
                   AND pid < ?2",
                params![now, EPHEMERAL_MIN],
            )
        })?;
        let names = with_busy_retry(&self.busy, || {
            self.conn.execute(
                "DELETE FROM name_cache
                 WHERE expiration IS NOT NULL AND expiration != 0 AND expiration <= ?1",
                params![now],
            )
        })?;
        info!(ids, names, "purged expired cache rows");
        Ok(ids + names)
    }

    /// Highest ephemeral id of `kind` held by any row.
    pub fn max_ephemeral_id(&self, kind: IdKind) -> Result<Option<u32>, MapError> {
        let max: Option<i64> = with_busy_retry(&self.busy, || {
            self.conn.query_row(
                "SELECT MAX(pid) FROM idmap_cache WHERE pid >= ?1 AND is_user = ?2",
                params![EPHEMERAL_MIN, kind.is_user()],
                |row| row.get(0),
            )
        })?;
        max.map(|p| pid_column(Some(p), "idmap_cache.pid")).transpose()
    }

    /// Drop every cached row.
    pub fn clear(&self) -> Result<(), MapError> {
        with_busy_retry(&self.busy, || {
            self.conn
                .execute_batch("DELETE FROM idmap_cache; DELETE FROM name_cache;")
        })?;
        info!("mapping cache cleared");
        Ok(())
    }
}

fn pid_column(pid: Option<i64>, column: &str) -> Result<u32, MapError> {
    pid.and_then(|p| u32::try_from(p).ok())
        .ok_or_else(|| MapError::CacheCorrupt(column.to_string()))
}

fn sid_columns(prefix: Option<String>, rid: Option<i64>) -> Result<Sid, MapError> {
    match (prefix, rid.and_then(|r| u32::try_from(r).ok())) {
        (Some(prefix), Some(rid)) => Ok(Sid::new(prefix, rid)),
        _ => Err(MapError::CacheCorrupt("sidprefix/rid".into())),
    }
}
