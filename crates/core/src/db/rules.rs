//! Rule store: the `namerules` table.

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use tracing::{debug, info, warn};

use super::busy::{with_busy_retry, BusyPolicy};
use super::{open_memory_store, open_store, schema, OnCorrupt};
use crate::errors::{ConflictKind, DatabaseError, MapError};
use crate::models::Direction;
use crate::rules::{rule_priority, NameRule, RuleFilter, StoredRule};
use crate::wellknown;

/// A windows-to-unix candidate, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct W2uCandidate {
    pub unixname: String,
    /// Set when the rule also applies unix-to-windows.
    pub u2w_order: Option<u8>,
}

/// A unix-to-windows candidate, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct U2wCandidate {
    pub winname: String,
    pub windomain: Option<String>,
    pub w2u_order: Option<u8>,
}

/// Per-worker handle on the rule store.
pub struct RuleStore {
    conn: Connection,
    busy: BusyPolicy,
}

impl RuleStore {
    /// Open (or create) the rule store. A corrupt file is an error.
    pub fn open<P: AsRef<Path>>(path: P, busy: BusyPolicy) -> Result<Self, DatabaseError> {
        let conn = open_store(path.as_ref(), schema::RULE_MIGRATIONS, &busy, OnCorrupt::Fail)?;
        Ok(Self { conn, busy })
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        let busy = BusyPolicy::rules(Duration::from_secs(2));
        let conn = open_memory_store(schema::RULE_MIGRATIONS, &busy)?;
        Ok(Self { conn, busy })
    }

    /// Store a rule.
    ///
    /// A rule without a domain gets `""` if its Windows name is well-known,
    /// otherwise `default_domain`, otherwise `""`. Duplicates are reported
    /// as [`MapError::ConfigConflict`] naming the colliding direction.
    pub fn add_rule(&self, rule: &NameRule, default_domain: Option<&str>) -> Result<(), MapError> {
        let order = rule_priority(
            &rule.winname,
            rule.windomain.as_deref(),
            &rule.unixname,
            rule.direction,
        )?;

        let windomain = match rule.windomain.as_deref() {
            Some(d) => d.to_string(),
            None if wellknown::lookup_by_name(&rule.winname).is_some() => String::new(),
            None => default_domain.unwrap_or_default().to_string(),
        };

        let result = with_busy_retry(&self.busy, || {
            self.conn.execute(
                "INSERT INTO namerules
                    (is_user, windomain, winname, is_nt4, unixname, w2u_order, u2w_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rule.is_user,
                    windomain,
                    rule.winname,
                    rule.is_nt4,
                    rule.unixname,
                    order.w2u,
                    order.u2w,
                ],
            )
        });

        match result {
            Ok(_) => {
                info!(
                    winname = %rule.winname,
                    windomain = %windomain,
                    unixname = %rule.unixname,
                    is_user = rule.is_user,
                    direction = %rule.direction,
                    "added name rule"
                );
                Ok(())
            }
            Err(e) => {
                let err = classify_insert_error(e);
                warn!(winname = %rule.winname, unixname = %rule.unixname, error = %err, "name rule rejected");
                Err(err)
            }
        }
    }

    /// Delete every rule matching `filter`. An empty filter is a no-op.
    pub fn remove_rules(&self, filter: &RuleFilter) -> Result<usize, MapError> {
        if filter.is_empty() {
            debug!("empty rule filter, nothing removed");
            return Ok(0);
        }

        let mut sql = String::from("DELETE FROM namerules WHERE is_user = ?");
        let mut args = vec![Value::Integer(filter.is_user as i64)];
        for (column, value) in [
            ("windomain", &filter.windomain),
            ("winname", &filter.winname),
            ("unixname", &filter.unixname),
        ] {
            if let Some(v) = value {
                sql.push_str(&format!(" AND {column} = ?"));
                args.push(Value::Text(v.clone()));
            }
        }
        match filter.direction {
            Some(Direction::Bi) => sql.push_str(" AND w2u_order > 0 AND u2w_order > 0"),
            Some(Direction::W2u) => {
                sql.push_str(" AND w2u_order > 0 AND (u2w_order = 0 OR u2w_order IS NULL)")
            }
            Some(Direction::U2w) => {
                sql.push_str(" AND u2w_order > 0 AND (w2u_order = 0 OR w2u_order IS NULL)")
            }
            None => {}
        }

        let n = with_busy_retry(&self.busy, || {
            self.conn.execute(&sql, params_from_iter(args.iter()))
        })?;
        info!(removed = n, "removed name rules");
        Ok(n)
    }

    /// Delete all user rules or all group rules.
    pub fn flush_rules(&self, is_user: bool) -> Result<usize, MapError> {
        let n = with_busy_retry(&self.busy, || {
            self.conn
                .execute("DELETE FROM namerules WHERE is_user = ?1", params![is_user])
        })?;
        info!(is_user, removed = n, "flushed name rules");
        Ok(n)
    }

    /// List rules, optionally only users or only groups.
    pub fn list_rules(&self, is_user: Option<bool>) -> Result<Vec<StoredRule>, MapError> {
        let rules = with_busy_retry(&self.busy, || {
            let mut stmt = self.conn.prepare(
                "SELECT is_user, windomain, winname, is_nt4, unixname, w2u_order, u2w_order
                 FROM namerules WHERE (?1 IS NULL OR is_user = ?1) ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![is_user], |row| {
                    Ok(StoredRule {
                        is_user: row.get(0)?,
                        windomain: row.get(1)?,
                        winname: row.get(2)?,
                        is_nt4: row.get(3)?,
                        unixname: row.get(4)?,
                        w2u_order: row.get(5)?,
                        u2w_order: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })?;
        Ok(rules)
    }

    /// Rules that may map `winname@windomain`, best first.
    ///
    /// With `default_domain` set, rules stored without a domain also match.
    pub fn w2u_candidates(
        &self,
        is_user: bool,
        winname: &str,
        windomain: &str,
        default_domain: bool,
    ) -> Result<Vec<W2uCandidate>, MapError> {
        let rows = with_busy_retry(&self.busy, || {
            let mut stmt = self.conn.prepare(
                "SELECT unixname, u2w_order FROM namerules
                 WHERE w2u_order > 0 AND is_user = ?1
                   AND (winname = ?2 COLLATE NOCASE OR winname = '*')
                   AND (windomain = ?3 COLLATE NOCASE OR windomain = '*'
                        OR (?4 AND (windomain IS NULL OR windomain = '')))
                 ORDER BY w2u_order",
            )?;
            let rows = stmt
                .query_map(params![is_user, winname, windomain, default_domain], |row| {
                    Ok(W2uCandidate {
                        unixname: row.get(0)?,
                        u2w_order: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })?;
        debug!(winname, windomain, candidates = rows.len(), "w2u rule candidates");
        Ok(rows)
    }

    /// Rules that may map the Unix name `unixname`, best first.
    pub fn u2w_candidates(&self, is_user: bool, unixname: &str) -> Result<Vec<U2wCandidate>, MapError> {
        let rows = with_busy_retry(&self.busy, || {
            let mut stmt = self.conn.prepare(
                "SELECT winname, windomain, w2u_order FROM namerules
                 WHERE u2w_order > 0 AND is_user = ?1
                   AND (unixname = ?2 OR unixname = '*')
                 ORDER BY u2w_order",
            )?;
            let rows = stmt
                .query_map(params![is_user, unixname], |row| {
                    Ok(U2wCandidate {
                        winname: row.get(0)?,
                        windomain: row.get(1)?,
                        w2u_order: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })?;
        debug!(unixname, candidates = rows.len(), "u2w rule candidates");
        Ok(rows)
    }
}

/// Map a failed rule insert to a conflict kind from the constraint message.
fn classify_insert_error(e: rusqlite::Error) -> MapError {
    if let rusqlite::Error::SqliteFailure(err, msg) = &e {
        if err.code == ErrorCode::ConstraintViolation {
            let msg = msg.as_deref().unwrap_or_default();
            if msg.contains("w2u_order") {
                return MapError::ConfigConflict(ConflictKind::W2u);
            }
            if msg.contains("u2w_order") {
                return MapError::ConfigConflict(ConflictKind::U2w);
            }
        }
    }
    MapError::Config(e.to_string())
}
