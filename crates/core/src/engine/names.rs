//! Name-based entry points: Windows name to unix id, unix id to Windows
//! name.

use tracing::{debug, warn};

use super::{NameSource, WorkerContext};
use crate::db::cache::now_ts;
use crate::directory;
use crate::errors::MapError;
use crate::models::{IdKind, IdType, MappingRequest, MappingResult, NameType};
use crate::sid::Sid;
use crate::wellknown;

impl WorkerContext {
    /// Map the Windows account `name@domain` to a unix id.
    ///
    /// Without a domain the mapping domain is assumed. Returns the account's
    /// SID along with the mapping result.
    pub fn resolve_name_to_id(
        &self,
        name: &str,
        domain: Option<&str>,
        wanted: IdType,
    ) -> Result<(Sid, MappingResult), MapError> {
        if name.is_empty() {
            return Err(MapError::InvalidArgument(match domain {
                Some(d) => format!("domain '{d}' without a name"),
                None => "empty name".into(),
            }));
        }
        let domain = domain
            .filter(|d| !d.is_empty())
            .or(self.engine.mapping_domain())
            .unwrap_or_default();

        let (sid, name_type, source) = self.lookup_win_name(name, domain)?;
        if source == NameSource::Directory {
            self.cache_name(&sid, name, domain, name_type);
        }
        let kind = name_type.verify(wanted)?;

        let request = MappingRequest::sid_to_id(sid.clone(), IdType::from(kind))
            .with_name(name, Some(domain.to_string()));
        let result = self.map_sids_to_ids(&[request]).pop().unwrap_or_default();
        Ok((sid, result))
    }

    /// Map a unix id to its SID and, when there is one, the Windows account
    /// name.
    pub fn resolve_id_to_name(&self, kind: IdKind, id: u32) -> MappingResult {
        let mut result = self
            .map_ids_to_sids(&[MappingRequest::id_to_sid(kind, id)])
            .pop()
            .unwrap_or_default();
        if !result.is_success() || result.name.is_some() {
            return result;
        }
        let Some(sid) = result.sid().cloned() else {
            return result;
        };

        if let Some(wk) = wellknown::lookup_name_by_sid(&sid) {
            result.name = Some(wk.name.to_string());
            return result;
        }
        match self.cache.lookup_name_by_sid(&sid) {
            Ok(cached) => {
                result.name = Some(cached.name);
                result.domain = cached.domain;
                return result;
            }
            Err(MapError::NotFound) => {}
            Err(e) => {
                warn!(%sid, error = %e, "name cache lookup failed");
                return result;
            }
        }
        // Local account SIDs have no Windows name.
        if self.engine.machine_sid().is_some_and(|m| sid.has_prefix(m)) {
            return result;
        }
        match directory::lookup_sid(self.engine.directory(), &sid) {
            Ok(entry) => {
                self.cache_name(&sid, &entry.name, &entry.domain, entry.name_type);
                result.name = Some(entry.name);
                result.domain = Some(entry.domain);
            }
            Err(e) => debug!(%sid, error = %e, "no Windows name for SID"),
        }
        result
    }

    fn cache_name(&self, sid: &Sid, name: &str, domain: &str, name_type: NameType) {
        let expiry = self.engine.name_expiry(now_ts());
        if let Err(e) = self
            .cache
            .upsert_name_mapping(sid, name, Some(domain), name_type, expiry)
        {
            warn!(%sid, error = %e, "failed to cache name");
        }
    }
}
