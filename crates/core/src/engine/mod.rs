//! Resolution orchestrator.
//!
//! An [`Engine`] holds what every worker shares: settings, the ephemeral id
//! allocator and the directory and name-service collaborators. Each worker
//! owns a [`WorkerContext`] with its own cache and rule store connections and
//! runs batches through it.
//!
//! SID to id resolution runs in two passes over a batch. Pass 1 settles what
//! it can from the well-known table and the cache and collects the SIDs
//! whose names are unknown. One directory round resolves those names for the
//! whole batch. Pass 2 applies name rules, falls back to the local namespace
//! or an ephemeral id, and the results are written back to the cache.
//!
//! Each item's progress is an [`ItemState`] handed from one pass to the next.

pub mod id2sid;
pub mod local;
pub mod names;
pub mod sid2id;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::cache::Expiry;
use crate::db::{BusyPolicy, CacheStore, RuleStore, CACHE_DB_FILE, RULES_DB_FILE};
use crate::directory::{self, DirectoryClient, DirectoryEntry, LdapDirectory, NoDirectory};
use crate::ephemeral::{EphemeralAllocator, SequentialIdAuthority, SidHistory};
use crate::errors::{CoreError, DatabaseError, MapError};
use crate::models::{IdKind, MappingRequest, MappingResult, NameType};
use crate::nameservice::{FilesNameService, NameService};
use crate::rules::{NameRule, RuleEngine, RuleFilter, StoredRule};
use crate::sid::Sid;
use crate::wellknown::{WK_MAX_GID, WK_MAX_UID};

// ---------------------------------------------------------------------------
// Per-item state
// ---------------------------------------------------------------------------

/// Where the Windows name of an item came from. Only names fetched from the
/// directory are written to the name cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    /// The request, the well-known table or the name cache.
    Cache,
    /// The directory, during this batch.
    Directory,
    /// The local account namespace. There is no Windows name to cache.
    Local,
}

/// A Windows account name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinName {
    pub name: String,
    pub domain: String,
    pub name_type: NameType,
}

/// An expired ephemeral id found in the cache, kept in case resolution ends
/// up minting an ephemeral id again.
pub type Fallback = Option<(IdKind, u32)>;

/// What the engine worked out for an item, to be written to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub source: NameSource,
    pub winname: Option<WinName>,
    /// The expired ephemeral id this resolution replaces, if any.
    pub superseded: Fallback,
    pub expiry: Expiry,
}

/// Progress of one request item through the passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    Start,
    /// Answered from the well-known table or a live cache row. Nothing to
    /// write back.
    CacheHit,
    /// Waiting on the batch's directory round.
    PendingDirectory { fallback: Fallback },
    /// Name known; rules run in pass 2.
    PendingRule {
        winname: WinName,
        source: NameSource,
        fallback: Fallback,
    },
    Resolved(Resolution),
    Failed(MapError),
}

impl ItemState {
    /// True once no later pass has anything to do for the item.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ItemState::CacheHit | ItemState::Resolved(_) | ItemState::Failed(_)
        )
    }
}

/// Record `err` on `res` and return the matching state.
pub(crate) fn fail(res: &mut MappingResult, err: MapError) -> ItemState {
    res.status = Err(err.clone());
    ItemState::Failed(err)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Settings the resolution passes need.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// SID prefix of this host's local accounts.
    pub machine_sid: Option<String>,
    /// Windows domain assumed for rules and names without one.
    pub mapping_domain: Option<String>,
    pub id_cache_ttl_secs: u64,
    pub name_cache_ttl_secs: u64,
    /// Map SIDs the directory cannot name to ephemeral ids.
    pub ephemeral_unresolved_sids: bool,
    /// Directory holding the store files. Stores are in memory when unset.
    pub data_dir: Option<PathBuf>,
    pub busy_warn: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            machine_sid: None,
            mapping_domain: None,
            id_cache_ttl_secs: 600,
            name_cache_ttl_secs: 3600,
            ephemeral_unresolved_sids: true,
            data_dir: None,
            busy_warn: Duration::from_secs(2),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            machine_sid: config.mapping.machine_sid.clone(),
            mapping_domain: config.mapping.mapping_domain.clone(),
            id_cache_ttl_secs: config.mapping.id_cache_ttl_secs,
            name_cache_ttl_secs: config.mapping.name_cache_ttl_secs,
            ephemeral_unresolved_sids: config.mapping.ephemeral_unresolved_sids,
            data_dir: Some(config.service.data_dir.clone()),
            busy_warn: config.store.busy_warn(),
        }
    }
}

/// State shared by all workers.
pub struct Engine {
    settings: EngineSettings,
    allocator: EphemeralAllocator,
    directory: Arc<dyn DirectoryClient>,
    names: Arc<dyn NameService>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        allocator: EphemeralAllocator,
        directory: Arc<dyn DirectoryClient>,
        names: Arc<dyn NameService>,
    ) -> Self {
        Self {
            settings,
            allocator,
            directory,
            names,
        }
    }

    /// Build the production engine: passwd/group files, LDAP when a
    /// directory is configured, and ephemeral ids that continue after the
    /// highest one already in the cache.
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let settings = EngineSettings::from(config);
        let data_dir = &config.service.data_dir;
        std::fs::create_dir_all(data_dir).map_err(DatabaseError::IoError)?;

        let names: Arc<dyn NameService> = Arc::new(FilesNameService::load(
            &config.nameservice.passwd_file,
            &config.nameservice.group_file,
        ));

        let directory: Arc<dyn DirectoryClient> = match &config.directory {
            Some(dir) => {
                let mut client = LdapDirectory::new(&dir.ldap_url, &dir.base_dn, dir.timeout());
                if let Some(bind_dn) = &dir.bind_dn {
                    client = client.with_bind(bind_dn, dir.bind_password.clone().unwrap_or_default());
                }
                if let Some(domain) = &dir.domain_name {
                    client = client.with_domain_name(domain);
                }
                Arc::new(client)
            }
            None => {
                info!("no directory configured");
                Arc::new(NoDirectory)
            }
        };

        let cache = CacheStore::open(data_dir.join(CACHE_DB_FILE), BusyPolicy::cache(settings.busy_warn))?;
        let first_uid = cache
            .max_ephemeral_id(IdKind::Uid)?
            .map_or(WK_MAX_UID, |m| m.max(WK_MAX_UID))
            .saturating_add(1);
        let first_gid = cache
            .max_ephemeral_id(IdKind::Gid)?
            .map_or(WK_MAX_GID, |m| m.max(WK_MAX_GID))
            .saturating_add(1);
        drop(cache);
        info!(first_uid, first_gid, "ephemeral id authority ready");

        let allocator = EphemeralAllocator::new(
            Arc::new(SequentialIdAuthority::starting_at(first_uid, first_gid)),
            config.ephemeral.block_size,
        );

        Ok(Self::new(settings, allocator, directory, names))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn names(&self) -> &dyn NameService {
        self.names.as_ref()
    }

    pub fn directory(&self) -> &dyn DirectoryClient {
        self.directory.as_ref()
    }

    pub fn allocator(&self) -> &EphemeralAllocator {
        &self.allocator
    }

    fn mapping_domain(&self) -> Option<&str> {
        self.settings.mapping_domain.as_deref().filter(|d| !d.is_empty())
    }

    fn machine_sid(&self) -> Option<&str> {
        self.settings.machine_sid.as_deref().filter(|s| !s.is_empty())
    }

    fn ephemeral_unresolved_sids(&self) -> bool {
        self.settings.ephemeral_unresolved_sids
    }

    fn id_expiry(&self, now: i64) -> Expiry {
        Expiry::after(now, self.settings.id_cache_ttl_secs)
    }

    fn name_expiry(&self, now: i64) -> Expiry {
        Expiry::after(now, self.settings.name_cache_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Worker context
// ---------------------------------------------------------------------------

/// One worker's store handles. Never shared between workers.
pub struct WorkerContext {
    engine: Arc<Engine>,
    cache: CacheStore,
    rules: RuleStore,
}

impl WorkerContext {
    /// Open this worker's store connections. The rule store must open
    /// cleanly; a corrupt cache is rebuilt.
    pub fn open(engine: Arc<Engine>) -> Result<Self, DatabaseError> {
        let (cache, rules) = match &engine.settings.data_dir {
            Some(dir) => (
                CacheStore::open(dir.join(CACHE_DB_FILE), BusyPolicy::cache(engine.settings.busy_warn))?,
                RuleStore::open(dir.join(RULES_DB_FILE), BusyPolicy::rules(engine.settings.busy_warn))?,
            ),
            None => (CacheStore::in_memory()?, RuleStore::in_memory()?),
        };
        debug!("worker context opened");
        Ok(Self::with_stores(engine, cache, rules))
    }

    pub fn with_stores(engine: Arc<Engine>, cache: CacheStore, rules: RuleStore) -> Self {
        Self {
            engine,
            cache,
            rules,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn rule_engine(&self) -> RuleEngine<'_> {
        RuleEngine::new(&self.rules, self.engine.names(), self.engine.mapping_domain())
    }

    // -- batches ------------------------------------------------------------

    /// Resolve a batch of SID to id requests.
    pub fn map_sids_to_ids(&self, requests: &[MappingRequest]) -> Vec<MappingResult> {
        let mut results = vec![MappingResult::default(); requests.len()];
        let mut states = vec![ItemState::Start; requests.len()];

        for ((req, res), state) in requests.iter().zip(results.iter_mut()).zip(states.iter_mut()) {
            *state = self.resolve_sid_to_id_pass1(req, res);
        }

        let found = self.directory_round(requests, &states);

        let mut history = SidHistory::new();
        for ((req, res), state) in requests.iter().zip(results.iter_mut()).zip(states.iter_mut()) {
            let entry = req.id1.as_sid().and_then(|sid| found.get(sid));
            let current = std::mem::replace(state, ItemState::Start);
            *state = self.resolve_sid_to_id_pass2(req, res, current, entry, &mut history);
        }

        for ((req, res), state) in requests.iter().zip(results.iter()).zip(states.iter()) {
            if let Err(e) = self.update_cache_after_sid2id(req, res, state) {
                warn!(id = %req.id1, error = %e, "failed to cache mapping");
            }
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        debug!(items = requests.len(), failed, ephemeral = history.len(), "sid to id batch done");
        results
    }

    /// One directory round for every item still missing a name. Each SID is
    /// sent once no matter how many items name it.
    fn directory_round(
        &self,
        requests: &[MappingRequest],
        states: &[ItemState],
    ) -> HashMap<Sid, Result<DirectoryEntry, MapError>> {
        let mut seen = HashSet::new();
        let sids: Vec<Sid> = requests
            .iter()
            .zip(states)
            .filter(|(_, state)| matches!(state, ItemState::PendingDirectory { .. }))
            .filter_map(|(req, _)| req.id1.as_sid())
            .filter(|sid| seen.insert((*sid).clone()))
            .cloned()
            .collect();
        if sids.is_empty() {
            return HashMap::new();
        }

        debug!(sids = sids.len(), "directory round");
        let results = directory::lookup_sids(self.engine.directory(), &sids);
        sids.into_iter().zip(results).collect()
    }

    /// Resolve a batch of id to SID requests.
    pub fn map_ids_to_sids(&self, requests: &[MappingRequest]) -> Vec<MappingResult> {
        let mut results = vec![MappingResult::default(); requests.len()];
        for (req, res) in requests.iter().zip(results.iter_mut()) {
            let state = self.resolve_id_to_sid_pass1(req, res);
            if let Err(e) = self.update_cache_after_id2sid(req, res, &state) {
                warn!(id = %req.id1, error = %e, "failed to cache mapping");
            }
        }
        results
    }

    // -- rule administration ------------------------------------------------

    /// Store a name rule. A rule without a domain takes the mapping domain.
    pub fn add_rule(&self, rule: &NameRule) -> Result<(), MapError> {
        self.rules.add_rule(rule, self.engine.mapping_domain())
    }

    pub fn remove_rules(&self, filter: &RuleFilter) -> Result<usize, MapError> {
        self.rules.remove_rules(filter)
    }

    pub fn flush_rules(&self, is_user: bool) -> Result<usize, MapError> {
        self.rules.flush_rules(is_user)
    }

    pub fn list_rules(&self, is_user: Option<bool>) -> Result<Vec<StoredRule>, MapError> {
        self.rules.list_rules(is_user)
    }
}
