//! Domain model types shared by the stores, the rule engine and the
//! resolution orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::MapError;
use crate::sid::Sid;

/// First id of the ephemeral range (2^31). Ids at or above it are minted by
/// the engine and never come from a name service.
pub const EPHEMERAL_MIN: u32 = 0x8000_0000;

/// Placeholder id returned alongside a failed resolution.
pub const SENTINEL_ID: u32 = u32::MAX;

pub const UID_NOBODY: u32 = 60001;
pub const GID_NOBODY: u32 = 60001;

pub fn is_ephemeral(id: u32) -> bool {
    id >= EPHEMERAL_MIN
}

// ---------------------------------------------------------------------------
// Identity kinds
// ---------------------------------------------------------------------------

/// Kind of a concrete Unix id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Uid,
    Gid,
}

impl IdKind {
    pub fn from_is_user(is_user: bool) -> Self {
        if is_user {
            IdKind::Uid
        } else {
            IdKind::Gid
        }
    }

    pub fn is_user(self) -> bool {
        self == IdKind::Uid
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Uid => write!(f, "uid"),
            IdKind::Gid => write!(f, "gid"),
        }
    }
}

/// The identity type a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    Uid,
    Gid,
    /// Either a uid or a gid, whichever the source identity turns out to be.
    PosixId,
    Sid,
}

impl From<IdKind> for IdType {
    fn from(kind: IdKind) -> Self {
        match kind {
            IdKind::Uid => IdType::Uid,
            IdKind::Gid => IdType::Gid,
        }
    }
}

/// Account type of a Windows name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameType {
    User,
    Group,
}

impl NameType {
    pub fn from_is_user(is_user: bool) -> Self {
        if is_user {
            NameType::User
        } else {
            NameType::Group
        }
    }

    pub fn is_user(self) -> bool {
        self == NameType::User
    }

    /// Value stored in the `type` column of the name cache.
    pub fn as_db(self) -> i64 {
        match self {
            NameType::User => 1,
            NameType::Group => 2,
        }
    }

    pub fn from_db(v: i64) -> Option<Self> {
        match v {
            1 => Some(NameType::User),
            2 => Some(NameType::Group),
            _ => None,
        }
    }

    /// Check the name type against the requested id type, narrowing
    /// [`IdType::PosixId`] to the matching kind.
    pub fn verify(self, wanted: IdType) -> Result<IdKind, MapError> {
        match (wanted, self) {
            (IdType::Uid, NameType::User) => Ok(IdKind::Uid),
            (IdType::Uid, NameType::Group) => Err(MapError::NotUser),
            (IdType::Gid, NameType::Group) => Ok(IdKind::Gid),
            (IdType::Gid, NameType::User) => Err(MapError::NotGroup),
            (IdType::PosixId, NameType::User) => Ok(IdKind::Uid),
            (IdType::PosixId, NameType::Group) => Ok(IdKind::Gid),
            (IdType::Sid, _) => Err(MapError::Unsupported("SID requested as unix id".into())),
        }
    }
}

/// Which way a mapping is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bi,
    W2u,
    U2w,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Bi => write!(f, "bidirectional"),
            Direction::W2u => write!(f, "windows-to-unix"),
            Direction::U2w => write!(f, "unix-to-windows"),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A resolved or requested identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Sid(Sid),
    Uid(u32),
    Gid(u32),
}

impl Identity {
    pub fn unix(kind: IdKind, id: u32) -> Self {
        match kind {
            IdKind::Uid => Identity::Uid(id),
            IdKind::Gid => Identity::Gid(id),
        }
    }

    /// `(kind, id)` for Unix identities.
    pub fn as_unix(&self) -> Option<(IdKind, u32)> {
        match self {
            Identity::Uid(id) => Some((IdKind::Uid, *id)),
            Identity::Gid(id) => Some((IdKind::Gid, *id)),
            Identity::Sid(_) => None,
        }
    }

    pub fn as_sid(&self) -> Option<&Sid> {
        match self {
            Identity::Sid(sid) => Some(sid),
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Sid(sid) => write!(f, "{sid}"),
            Identity::Uid(id) => write!(f, "uid:{id}"),
            Identity::Gid(id) => write!(f, "gid:{id}"),
        }
    }
}

/// Per-request switches set by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFlags {
    /// Never mint a new ephemeral id; a cache miss is terminal.
    #[serde(default)]
    pub no_new_id_alloc: bool,
    /// Never consult the directory or name service; a cache miss is terminal.
    #[serde(default)]
    pub no_directory: bool,
}

/// One item of a mapping batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRequest {
    pub id1: Identity,
    /// Name of `id1` if the caller already knows it.
    #[serde(default)]
    pub id1_name: Option<String>,
    #[serde(default)]
    pub id1_domain: Option<String>,
    pub id2_type: IdType,
    #[serde(default)]
    pub flags: RequestFlags,
}

impl MappingRequest {
    pub fn sid_to_id(sid: Sid, wanted: IdType) -> Self {
        Self {
            id1: Identity::Sid(sid),
            id1_name: None,
            id1_domain: None,
            id2_type: wanted,
            flags: RequestFlags::default(),
        }
    }

    pub fn id_to_sid(kind: IdKind, id: u32) -> Self {
        Self {
            id1: Identity::unix(kind, id),
            id1_name: None,
            id1_domain: None,
            id2_type: IdType::Sid,
            flags: RequestFlags::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>, domain: Option<String>) -> Self {
        self.id1_name = Some(name.into());
        self.id1_domain = domain;
        self
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Answer for one [`MappingRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingResult {
    pub id: Option<Identity>,
    pub direction: Direction,
    pub status: Result<(), MapError>,
    /// Name of the resolved identity: the unix name for SID to id, the
    /// Windows name for id to SID.
    pub name: Option<String>,
    pub domain: Option<String>,
}

impl Default for MappingResult {
    fn default() -> Self {
        Self {
            id: None,
            direction: Direction::Bi,
            status: Err(MapError::NotFound),
            name: None,
            domain: None,
        }
    }
}

impl MappingResult {
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    pub fn unix_id(&self) -> Option<(IdKind, u32)> {
        self.id.as_ref().and_then(Identity::as_unix)
    }

    pub fn sid(&self) -> Option<&Sid> {
        self.id.as_ref().and_then(Identity::as_sid)
    }

    /// Reset to a failed answer carrying the "nobody" id of `kind`.
    pub(crate) fn set_nobody(&mut self, kind: IdKind) {
        let id = match kind {
            IdKind::Uid => UID_NOBODY,
            IdKind::Gid => GID_NOBODY,
        };
        self.id = Some(Identity::unix(kind, id));
        self.direction = Direction::Bi;
        self.name = None;
        self.domain = None;
    }
}
