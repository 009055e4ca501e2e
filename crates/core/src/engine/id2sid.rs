//! Uid/gid to SID resolution.
//!
//! Runs in a single pass: rule destinations are resolved one name at a time
//! rather than through a batch directory round.

use tracing::debug;

use super::{fail, local, ItemState, NameSource, Resolution, WinName, WorkerContext};
use crate::db::cache::{now_ts, Expiry, IdMapping};
use crate::directory;
use crate::errors::MapError;
use crate::models::{is_ephemeral, Direction, IdKind, IdType, Identity, MappingRequest, MappingResult, NameType};
use crate::sid::Sid;
use crate::wellknown;

impl WorkerContext {
    pub fn resolve_id_to_sid_pass1(&self, req: &MappingRequest, res: &mut MappingResult) -> ItemState {
        let Some((kind, id)) = req.id1.as_unix() else {
            return fail(res, MapError::Unsupported("SID as id to SID input".into()));
        };
        if req.id2_type != IdType::Sid {
            return fail(res, MapError::Unsupported(format!("{} to unix id", kind)));
        }

        if let Some(wk) = wellknown::lookup_by_id(kind, id) {
            debug!(%kind, id, name = wk.name, "well-known id");
            res.id = Some(Identity::Sid(wk.sid()));
            res.direction = wk.direction;
            res.name = Some(wk.name.to_string());
            res.domain = None;
            res.status = Ok(());
            return ItemState::CacheHit;
        }

        match self.cache.lookup_sid_by_id(kind, id) {
            Ok(hit) => {
                res.id = Some(Identity::Sid(hit.sid));
                res.direction = hit.direction;
                res.name = hit.winname;
                res.domain = hit.windomain;
                res.status = Ok(());
                return ItemState::CacheHit;
            }
            Err(MapError::NotFound) => {}
            Err(e) => return fail(res, e),
        }

        // Ephemeral ids only come into being in the other direction.
        if is_ephemeral(id) {
            return fail(res, MapError::NoMapping);
        }
        if req.flags.no_new_id_alloc || req.flags.no_directory {
            return fail(res, MapError::NoMapping);
        }

        let unixname = match req.id1_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => match self.engine.names().lookup_by_id(kind, id) {
                Ok(name) => name,
                Err(MapError::NotFound) => return self.local_account_sid(kind, id, res),
                Err(e) => return self.local_sid_on_error(kind, id, res, e),
            },
        };

        let mut from_directory = false;
        let outcome = self.rule_engine().map_unix_to_win(&unixname, kind, |name, domain| {
            let (sid, name_type, source) = self.lookup_win_name(name, domain)?;
            from_directory = source == NameSource::Directory;
            Ok((sid, name_type))
        });

        match outcome {
            Ok(m) => {
                res.id = Some(Identity::Sid(m.sid));
                res.direction = m.direction;
                res.name = Some(m.winname.clone());
                res.domain = Some(m.windomain.clone());
                res.status = Ok(());
                ItemState::Resolved(Resolution {
                    source: if from_directory {
                        NameSource::Directory
                    } else {
                        NameSource::Cache
                    },
                    winname: Some(WinName {
                        name: m.winname,
                        domain: m.windomain,
                        name_type: m.name_type,
                    }),
                    superseded: None,
                    expiry: self.engine.id_expiry(now_ts()),
                })
            }
            Err(MapError::NotFound) => self.local_account_sid(kind, id, res),
            Err(e) => self.local_sid_on_error(kind, id, res, e),
        }
    }

    /// The item fails with `err` but still carries the local account SID as
    /// its id when one can be formed. Nothing is cached.
    fn local_sid_on_error(
        &self,
        kind: IdKind,
        id: u32,
        res: &mut MappingResult,
        err: MapError,
    ) -> ItemState {
        let local = self
            .engine
            .machine_sid()
            .and_then(|machine_sid| local::encode(machine_sid, kind, id).ok());
        if let Some(sid) = local {
            debug!(%kind, id, %sid, error = %err, "local account SID after failed lookup");
            res.id = Some(Identity::Sid(sid));
            res.direction = Direction::Bi;
            res.name = None;
            res.domain = None;
        }
        fail(res, err)
    }

    /// Synthesize a SID under the machine SID for an account with no
    /// Windows counterpart.
    fn local_account_sid(&self, kind: IdKind, id: u32, res: &mut MappingResult) -> ItemState {
        let Some(machine_sid) = self.engine.machine_sid() else {
            debug!(%kind, id, "no machine SID configured");
            return fail(res, MapError::NoMapping);
        };
        match local::encode(machine_sid, kind, id) {
            Ok(sid) => {
                debug!(%kind, id, %sid, "local account SID");
                res.id = Some(Identity::Sid(sid));
                res.direction = Direction::Bi;
                res.name = None;
                res.domain = None;
                res.status = Ok(());
                ItemState::Resolved(Resolution {
                    source: NameSource::Local,
                    winname: None,
                    superseded: None,
                    expiry: Expiry::Never,
                })
            }
            Err(e) => fail(res, e),
        }
    }

    /// Resolve a Windows `name@domain` to a SID: well-known table, then the
    /// name cache, then the directory.
    pub(crate) fn lookup_win_name(
        &self,
        name: &str,
        domain: &str,
    ) -> Result<(Sid, NameType, NameSource), MapError> {
        if let Some(wk) = wellknown::lookup_by_name(name) {
            return Ok((wk.sid(), NameType::from_is_user(wk.is_user), NameSource::Cache));
        }
        let domain_filter = Some(domain).filter(|d| !d.is_empty());
        match self.cache.lookup_sid_by_name(name, domain_filter) {
            Ok((sid, name_type)) => return Ok((sid, name_type, NameSource::Cache)),
            Err(MapError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let entry = directory::lookup_name(self.engine.directory(), name, domain)?;
        Ok((entry.sid, entry.name_type, NameSource::Directory))
    }

    /// Write an id to SID result to the cache.
    pub fn update_cache_after_id2sid(
        &self,
        req: &MappingRequest,
        res: &MappingResult,
        state: &ItemState,
    ) -> Result<(), MapError> {
        let ItemState::Resolved(resolution) = state else {
            return Ok(());
        };
        if !res.is_success() {
            return Ok(());
        }
        let (Some((kind, pid)), Some(sid)) = (req.id1.as_unix(), res.sid()) else {
            return Ok(());
        };

        let winname = resolution.winname.as_ref();
        let unixname = req
            .id1_name
            .clone()
            .or_else(|| self.engine.names().lookup_by_id(kind, pid).ok());
        self.cache.upsert_id_mapping(&IdMapping {
            sid: sid.clone(),
            windomain: winname.map(|w| w.domain.clone()),
            winname: winname.map(|w| w.name.clone()),
            kind,
            pid,
            unixname,
            direction: res.direction,
            expiry: resolution.expiry,
        })?;

        if resolution.source == NameSource::Directory {
            if let Some(w) = winname {
                self.cache.upsert_name_mapping(
                    sid,
                    &w.name,
                    Some(&w.domain),
                    w.name_type,
                    self.engine.name_expiry(now_ts()),
                )?;
            }
        }
        Ok(())
    }
}
