//! SID to uid/gid passes.

use tracing::debug;

use super::{fail, local, Fallback, ItemState, NameSource, Resolution, WinName, WorkerContext};
use crate::db::cache::{now_ts, Expiry, IdMapping};
use crate::directory::DirectoryEntry;
use crate::ephemeral::SidHistory;
use crate::errors::MapError;
use crate::models::{
    is_ephemeral, Direction, IdKind, IdType, Identity, MappingRequest, MappingResult, NameType,
};
use crate::sid::Sid;
use crate::wellknown::{self, WellKnownMatch};

/// Kind used for the "nobody" id when the request does not pin one down.
fn nobody_kind(wanted: IdType) -> IdKind {
    match wanted {
        IdType::Gid => IdKind::Gid,
        _ => IdKind::Uid,
    }
}

/// Name type a request for `wanted` implies, when it implies one.
fn implied_name_type(wanted: IdType) -> Option<NameType> {
    match wanted {
        IdType::Uid => Some(NameType::User),
        IdType::Gid => Some(NameType::Group),
        IdType::PosixId | IdType::Sid => None,
    }
}

impl WorkerContext {
    /// Pass 1: well-known table, cache, and local name lookup.
    pub fn resolve_sid_to_id_pass1(&self, req: &MappingRequest, res: &mut MappingResult) -> ItemState {
        let Some(sid) = req.id1.as_sid() else {
            return fail(res, MapError::SidFormat(req.id1.to_string()));
        };
        if req.id2_type == IdType::Sid {
            return fail(res, MapError::Unsupported("SID to SID".into()));
        }

        match wellknown::lookup_by_sid(sid, req.id2_type) {
            Some(WellKnownMatch::Mapped { kind, id, direction }) => {
                debug!(%sid, %kind, id, "well-known SID");
                res.id = Some(Identity::unix(kind, id));
                res.direction = direction;
                res.status = Ok(());
                return ItemState::CacheHit;
            }
            Some(WellKnownMatch::Unmapped) => {
                debug!(%sid, "well-known SID without a unix id");
                return fail(res, MapError::NotFound);
            }
            None => {}
        }

        let flags = req.flags;
        let no_more = flags.no_new_id_alloc || flags.no_directory;
        let mut fallback = None;
        match self.cache.lookup_id_by_sid(sid, req.id2_type) {
            Ok(hit) if !hit.expired || no_more => {
                if let Err(e) = hit.check_kind(req.id2_type) {
                    return fail(res, e);
                }
                res.id = Some(Identity::unix(hit.kind, hit.id));
                res.direction = hit.direction;
                res.name = hit.unixname;
                res.status = Ok(());
                return ItemState::CacheHit;
            }
            Ok(hit) => {
                debug!(%sid, id = hit.id, "expired ephemeral id, revalidating");
                fallback = Some((hit.kind, hit.id));
            }
            Err(MapError::NotFound) if no_more => {
                res.set_nobody(nobody_kind(req.id2_type));
                return fail(res, MapError::NotFound);
            }
            Err(MapError::NotFound) => {}
            Err(e) => return fail(res, e),
        }

        // A caller-supplied name is trusted when the request says whether it
        // is a user or a group.
        if let (Some(name), Some(name_type)) = (
            req.id1_name.as_deref().filter(|n| !n.is_empty()),
            implied_name_type(req.id2_type),
        ) {
            return ItemState::PendingRule {
                winname: WinName {
                    name: name.to_string(),
                    domain: req.id1_domain.clone().unwrap_or_default(),
                    name_type,
                },
                source: NameSource::Cache,
                fallback,
            };
        }

        if let Some(wk) = wellknown::lookup_name_by_sid(sid) {
            return ItemState::PendingRule {
                winname: WinName {
                    name: wk.name.to_string(),
                    domain: String::new(),
                    name_type: NameType::from_is_user(wk.is_user),
                },
                source: NameSource::Cache,
                fallback,
            };
        }

        match self.cache.lookup_name_by_sid(sid) {
            Ok(cached) => ItemState::PendingRule {
                winname: WinName {
                    name: cached.name,
                    domain: cached.domain.unwrap_or_default(),
                    name_type: cached.name_type,
                },
                source: NameSource::Cache,
                fallback,
            },
            Err(MapError::NotFound) => ItemState::PendingDirectory { fallback },
            Err(e) => fail(res, e),
        }
    }

    /// Pass 2: directory answer, type check, name rules, then the local
    /// namespace or an ephemeral id.
    pub fn resolve_sid_to_id_pass2(
        &self,
        req: &MappingRequest,
        res: &mut MappingResult,
        state: ItemState,
        directory: Option<&Result<DirectoryEntry, MapError>>,
        history: &mut SidHistory,
    ) -> ItemState {
        let Some(sid) = req.id1.as_sid() else {
            return state;
        };

        let (winname, source, fallback) = match state {
            ItemState::PendingRule {
                winname,
                source,
                fallback,
            } => (winname, source, fallback),
            ItemState::PendingDirectory { fallback } => match directory {
                Some(Ok(entry)) => (
                    WinName {
                        name: entry.name.clone(),
                        domain: entry.domain.clone(),
                        name_type: entry.name_type,
                    },
                    NameSource::Directory,
                    fallback,
                ),
                Some(Err(e)) => {
                    let err = e.clone();
                    return self.unresolved_sid_fallback(sid, req, res, err, fallback, history);
                }
                None => {
                    let err = MapError::NotFound;
                    return self.unresolved_sid_fallback(sid, req, res, err, fallback, history);
                }
            },
            other => return other,
        };

        let kind = match winname.name_type.verify(req.id2_type) {
            Ok(kind) => kind,
            Err(e) => {
                res.set_nobody(nobody_kind(req.id2_type));
                return fail(res, e);
            }
        };
        res.domain = Some(winname.domain.clone());

        let now = now_ts();
        match self
            .rule_engine()
            .map_win_to_unix(&winname.name, Some(&winname.domain), kind)
        {
            Ok(m) => {
                res.id = Some(Identity::unix(m.kind, m.id));
                res.direction = m.direction;
                res.name = Some(m.unixname);
                res.status = Ok(());
                ItemState::Resolved(Resolution {
                    source,
                    winname: Some(winname),
                    superseded: fallback,
                    expiry: self.engine.id_expiry(now),
                })
            }
            Err(MapError::NotFound) => {
                let id = match fallback {
                    Some((fk, fid)) if fk == kind => {
                        history.insert(sid, kind, fid);
                        fid
                    }
                    _ => match history.get_or_allocate(sid, kind, self.engine.allocator()) {
                        Ok(id) => id,
                        Err(e) => return fail(res, e),
                    },
                };
                res.id = Some(Identity::unix(kind, id));
                res.direction = Direction::Bi;
                res.name = None;
                res.status = Ok(());
                ItemState::Resolved(Resolution {
                    source,
                    winname: Some(winname),
                    superseded: None,
                    expiry: self.engine.id_expiry(now),
                })
            }
            Err(e) => {
                res.set_nobody(kind);
                fail(res, e)
            }
        }
    }

    /// The name could not be resolved. A SID under the machine SID may
    /// still decode to a local account; otherwise a SID the directory does
    /// not know gets an ephemeral id when that is enabled.
    fn unresolved_sid_fallback(
        &self,
        sid: &Sid,
        req: &MappingRequest,
        res: &mut MappingResult,
        err: MapError,
        fallback: Fallback,
        history: &mut SidHistory,
    ) -> ItemState {
        res.set_nobody(nobody_kind(req.id2_type));
        if let Some(machine_sid) = self.engine.machine_sid().filter(|m| sid.has_prefix(m)) {
            match local::decode(sid, req.id2_type) {
                Ok((kind, id)) => {
                    debug!(%sid, %kind, id, machine_sid, "local account SID");
                    res.id = Some(Identity::unix(kind, id));
                    res.direction = Direction::Bi;
                    res.status = Ok(());
                    return ItemState::Resolved(Resolution {
                        source: NameSource::Local,
                        winname: None,
                        superseded: None,
                        expiry: Expiry::Never,
                    });
                }
                Err(MapError::NotFound) => {}
                Err(e) => return fail(res, e),
            }
        }

        if err != MapError::NotFound || !self.engine.ephemeral_unresolved_sids() {
            return fail(res, err);
        }
        // Treated as a user unless the caller asked for a group.
        let kind = nobody_kind(req.id2_type);
        let id = match fallback {
            Some((fk, fid)) if fk == kind => {
                history.insert(sid, kind, fid);
                fid
            }
            _ => match history.get_or_allocate(sid, kind, self.engine.allocator()) {
                Ok(id) => id,
                Err(e) => return fail(res, e),
            },
        };
        debug!(%sid, %kind, id, "ephemeral id for unresolved SID");
        res.id = Some(Identity::unix(kind, id));
        res.direction = Direction::Bi;
        res.name = None;
        res.status = Ok(());
        ItemState::Resolved(Resolution {
            source: NameSource::Local,
            winname: None,
            superseded: None,
            expiry: self.engine.id_expiry(now_ts()),
        })
    }

    /// Write what pass 2 computed to the cache. Failed items and items
    /// answered from the cache are skipped.
    pub fn update_cache_after_sid2id(
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
        let (Some(sid), Some((kind, pid))) = (req.id1.as_sid(), res.unix_id()) else {
            return Ok(());
        };

        if let Some((old_kind, old_id)) = resolution.superseded {
            if !is_ephemeral(pid) {
                debug!(%sid, old_id, pid, "replacing expired ephemeral id");
                self.cache.invalidate_reverse_direction(sid, old_kind)?;
            }
        }

        let winname = resolution.winname.as_ref();
        self.cache.upsert_id_mapping(&IdMapping {
            sid: sid.clone(),
            windomain: winname.map(|w| w.domain.clone()),
            winname: winname.map(|w| w.name.clone()),
            kind,
            pid,
            unixname: res.name.clone(),
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
