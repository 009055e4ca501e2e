//! Local Unix account lookups.
//!
//! The engine only needs name to id and id to name for users and groups.
//! [`FilesNameService`] reads passwd/group style files and can be reloaded
//! at runtime; [`StaticNameService`] is a fixed in-memory table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::errors::MapError;
use crate::models::IdKind;

/// Unix account database.
pub trait NameService: Send + Sync {
    /// Id of the user or group called `name`. `NotFound` if there is none.
    fn lookup_by_name(&self, kind: IdKind, name: &str) -> Result<u32, MapError>;

    /// Name of the user or group with id `id`. `NotFound` if there is none.
    fn lookup_by_id(&self, kind: IdKind, id: u32) -> Result<String, MapError>;
}

// ---------------------------------------------------------------------------
// In-memory tables
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct Accounts {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

impl Accounts {
    fn insert(&mut self, name: &str, id: u32) {
        self.by_name.insert(name.to_string(), id);
        // First entry wins for duplicate ids, like getpwuid.
        self.by_id.entry(id).or_insert_with(|| name.to_string());
    }
}

#[derive(Debug, Default, Clone)]
struct Tables {
    users: Accounts,
    groups: Accounts,
}

impl Tables {
    fn accounts(&self, kind: IdKind) -> &Accounts {
        match kind {
            IdKind::Uid => &self.users,
            IdKind::Gid => &self.groups,
        }
    }

    fn by_name(&self, kind: IdKind, name: &str) -> Result<u32, MapError> {
        self.accounts(kind)
            .by_name
            .get(name)
            .copied()
            .ok_or(MapError::NotFound)
    }

    fn by_id(&self, kind: IdKind, id: u32) -> Result<String, MapError> {
        self.accounts(kind)
            .by_id
            .get(&id)
            .cloned()
            .ok_or(MapError::NotFound)
    }
}

/// Fixed set of accounts.
#[derive(Debug, Default, Clone)]
pub struct StaticNameService {
    tables: Tables,
}

impl StaticNameService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, name: &str, uid: u32) -> Self {
        self.tables.users.insert(name, uid);
        self
    }

    pub fn with_group(mut self, name: &str, gid: u32) -> Self {
        self.tables.groups.insert(name, gid);
        self
    }
}

impl NameService for StaticNameService {
    fn lookup_by_name(&self, kind: IdKind, name: &str) -> Result<u32, MapError> {
        self.tables.by_name(kind, name)
    }

    fn lookup_by_id(&self, kind: IdKind, id: u32) -> Result<String, MapError> {
        self.tables.by_id(kind, id)
    }
}

// ---------------------------------------------------------------------------
// passwd / group files
// ---------------------------------------------------------------------------

/// Accounts read from passwd and group files.
pub struct FilesNameService {
    passwd_file: PathBuf,
    group_file: PathBuf,
    tables: RwLock<Tables>,
}

impl FilesNameService {
    /// Load both files. A missing file yields an empty table with a warning.
    pub fn load(passwd_file: impl Into<PathBuf>, group_file: impl Into<PathBuf>) -> Self {
        let service = Self {
            passwd_file: passwd_file.into(),
            group_file: group_file.into(),
            tables: RwLock::new(Tables::default()),
        };
        service.reload();
        service
    }

    /// Re-read both files.
    pub fn reload(&self) {
        let tables = Tables {
            users: read_accounts(&self.passwd_file),
            groups: read_accounts(&self.group_file),
        };
        info!(
            users = tables.users.by_name.len(),
            groups = tables.groups.by_name.len(),
            "loaded local accounts"
        );
        let mut guard = self.tables.write().unwrap_or_else(|poisoned| {
            warn!("name service lock was poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = tables;
    }

    fn with_tables<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.tables.read().unwrap_or_else(|poisoned| {
            warn!("name service lock was poisoned, recovering");
            poisoned.into_inner()
        });
        f(&guard)
    }
}

impl NameService for FilesNameService {
    fn lookup_by_name(&self, kind: IdKind, name: &str) -> Result<u32, MapError> {
        self.with_tables(|t| t.by_name(kind, name))
    }

    fn lookup_by_id(&self, kind: IdKind, id: u32) -> Result<String, MapError> {
        self.with_tables(|t| t.by_id(kind, id))
    }
}

fn read_accounts(path: &Path) -> Accounts {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_accounts(&contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read account file");
            Accounts::default()
        }
    }
}

/// Parse `name:password:id:...` lines. Comments, blank lines and NIS
/// `+`/`-` entries are skipped.
fn parse_accounts(contents: &str) -> Accounts {
    let mut accounts = Accounts::default();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('+') || line.starts_with('-') {
            continue;
        }
        let mut fields = line.split(':');
        let name = fields.next().unwrap_or_default();
        let id = fields.nth(1).and_then(|f| f.parse::<u32>().ok());
        match id {
            Some(id) if !name.is_empty() => accounts.insert(name, id),
            _ => debug!(line = lineno + 1, "skipping malformed account line"),
        }
    }
    accounts
}
