//! Error types for the sidmap core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. [`MapError`] is different from the others: it is the
//! per-item status attached to every mapping result, so it is `Clone` and
//! carries no foreign error values.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

// ---------------------------------------------------------------------------
// Mapping status
// ---------------------------------------------------------------------------

/// Which unique key of the rule table a duplicate rule collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// `(winname, windomain, is_user, w2u_order)`
    W2u,
    /// `(unixname, is_user, u2w_order)`
    U2w,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::W2u => write!(f, "windows-to-unix"),
            ConflictKind::U2w => write!(f, "unix-to-windows"),
        }
    }
}

/// Outcome of resolving a single mapping item.
///
/// `NotFound` is a stage-local signal: the orchestrator turns it into "try
/// the next source". Everything else is terminal for the item it is attached
/// to and never affects sibling items in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    /// No data at this resolution stage.
    #[error("not found")]
    NotFound,

    /// An administrative rule explicitly denies a mapping.
    #[error("intentionally unmapped")]
    NoMapping,

    /// The identity resolved to a group but a uid was requested.
    #[error("identity is not a user")]
    NotUser,

    /// The identity resolved to a user but a gid was requested.
    #[error("identity is not a group")]
    NotGroup,

    /// Transient directory failure that survived every retry.
    #[error("directory temporarily unavailable: {0}")]
    RetriableDirectory(String),

    #[error("out of memory")]
    OutOfMemory,

    /// A cache row is missing a column the engine requires.
    #[error("mapping cache is corrupt: {0}")]
    CacheCorrupt(String),

    /// Unexpected failure from a backing store.
    #[error("internal store error: {0}")]
    InternalStore(String),

    /// A rule with the same key already exists.
    #[error("conflicting {0} name rule already exists")]
    ConfigConflict(ConflictKind),

    /// Rule insert failed for a reason other than a uniqueness conflict.
    #[error("name rule configuration error: {0}")]
    Config(String),

    /// Malformed windows-to-unix rule.
    #[error("invalid windows-to-unix name rule: {0}")]
    W2uNameRule(String),

    /// Malformed unix-to-windows rule.
    #[error("invalid unix-to-windows name rule: {0}")]
    U2wNameRule(String),

    #[error("invalid SID: {0}")]
    SidFormat(String),

    /// A rule needs the default mapping domain but none is configured.
    #[error("no mapping domain configured for '{0}'")]
    DomainNotFound(String),

    /// The requested identity type is not handled by this path.
    #[error("unsupported identity type: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The id-space authority could not hand out another block.
    #[error("ephemeral id allocation failed: {0}")]
    Allocation(String),
}

impl From<DatabaseError> for MapError {
    fn from(e: DatabaseError) -> Self {
        MapError::InternalStore(e.to_string())
    }
}

impl From<rusqlite::Error> for MapError {
    fn from(e: rusqlite::Error) -> Self {
        MapError::InternalStore(e.to_string())
    }
}

impl From<DirectoryError> for MapError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound => MapError::NotFound,
            DirectoryError::Transient(detail) => MapError::RetriableDirectory(detail),
            DirectoryError::Timeout => MapError::RetriableDirectory("lookup timed out".into()),
            other => MapError::InternalStore(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors related to loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file was not found at the expected path.
    #[error("config file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("config parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("environment variable '{var}' not set (referenced by {field})")]
    EnvVarMissing {
        var: String,
        field: String,
    },

    /// A config value is present but invalid.
    #[error("invalid config value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error while reading config.
    #[error("config I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A rusqlite error.
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A schema migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// The store file exists but is not a usable database.
    #[error("{store} store at '{path}' is corrupt: {detail}")]
    Corrupt {
        store: String,
        path: String,
        detail: String,
    },

    /// Generic I/O error (e.g. removing a corrupt cache file).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Directory errors
// ---------------------------------------------------------------------------

/// Errors from the directory lookup client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The directory has no entry for the item.
    #[error("directory entry not found")]
    NotFound,

    /// Network or server hiccup; the whole batch may be retried.
    #[error("transient directory error: {0}")]
    Transient(String),

    /// The item did not complete in time.
    #[error("directory lookup timed out")]
    Timeout,

    /// The entry was found but could not be interpreted.
    #[error("malformed directory entry: {0}")]
    Malformed(String),

    /// LDAP protocol or server error that retrying will not fix.
    #[error("LDAP error: {0}")]
    Ldap(String),
}

impl DirectoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DirectoryError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Worker pool errors
// ---------------------------------------------------------------------------

/// Errors from submitting work to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The pool is shutting down and takes no more batches.
    #[error("worker pool is shut down")]
    ShutDown,

    /// The worker handling a batch went away without answering.
    #[error("worker exited before answering")]
    WorkerLost,
}
