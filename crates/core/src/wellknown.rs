//! Static table of reserved Windows identities.
//!
//! Most entries are defined but unmapped: they have a name so they can be
//! recognised and displayed, but no Unix id. Resolving one of those stops
//! with `NotFound` instead of falling through to rules or ephemeral ids.

use crate::models::{Direction, IdKind, IdType, GID_NOBODY};
use crate::sid::Sid;

pub const WK_CREATOR_OWNER_UID: u32 = 0x8000_0000;
pub const WK_LOCAL_SYSTEM_GID: u32 = 0x8000_0000;
pub const WK_CREATOR_GROUP_GID: u32 = 0x8000_0001;

/// Highest uid reserved for well-known identities.
pub const WK_MAX_UID: u32 = WK_CREATOR_OWNER_UID;
/// Highest gid reserved for well-known identities.
pub const WK_MAX_GID: u32 = WK_CREATOR_GROUP_GID;

/// One row of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnown {
    pub prefix: &'static str,
    pub rid: u32,
    pub name: &'static str,
    pub is_user: bool,
    /// `None` for identities that are recognised but never mapped.
    pub id: Option<u32>,
    pub direction: Direction,
}

impl WellKnown {
    pub fn sid(&self) -> Sid {
        Sid::new(self.prefix, self.rid)
    }

    pub fn kind(&self) -> IdKind {
        IdKind::from_is_user(self.is_user)
    }
}

const fn unmapped(prefix: &'static str, rid: u32, name: &'static str, is_user: bool) -> WellKnown {
    WellKnown {
        prefix,
        rid,
        name,
        is_user,
        id: None,
        direction: Direction::Bi,
    }
}

const fn mapped(prefix: &'static str, rid: u32, name: &'static str, is_user: bool, id: u32) -> WellKnown {
    WellKnown {
        prefix,
        rid,
        name,
        is_user,
        id: Some(id),
        direction: Direction::Bi,
    }
}

pub static WELL_KNOWN: &[WellKnown] = &[
    unmapped("S-1-1", 0, "Everyone", false),
    mapped("S-1-3", 0, "Creator Owner", true, WK_CREATOR_OWNER_UID),
    mapped("S-1-3", 1, "Creator Group", false, WK_CREATOR_GROUP_GID),
    unmapped("S-1-3", 2, "Creator Owner Server", true),
    unmapped("S-1-3", 3, "Creator Group Server", false),
    unmapped("S-1-5", 1, "Dialup", false),
    unmapped("S-1-5", 2, "Network", false),
    unmapped("S-1-5", 3, "Batch", false),
    unmapped("S-1-5", 4, "Interactive", false),
    unmapped("S-1-5", 6, "Service", false),
    mapped("S-1-5", 7, "Anonymous Logon", false, GID_NOBODY),
    unmapped("S-1-5", 8, "Proxy", false),
    unmapped("S-1-5", 9, "Enterprise Domain Controllers", false),
    unmapped("S-1-5", 10, "Self", false),
    unmapped("S-1-5", 11, "Authenticated Users", false),
    unmapped("S-1-5", 12, "Restricted Code", false),
    unmapped("S-1-5", 13, "Terminal Server User", false),
    unmapped("S-1-5", 14, "Remote Interactive Logon", false),
    unmapped("S-1-5", 15, "This Organization", false),
    mapped("S-1-5", 18, "Local System", false, WK_LOCAL_SYSTEM_GID),
    unmapped("S-1-5", 19, "Local Service", false),
    unmapped("S-1-5", 20, "Network Service", false),
    unmapped("S-1-5", 1000, "Other Organization", false),
    unmapped("S-1-5-64", 21, "Digest Authentication", false),
    unmapped("S-1-5-64", 10, "NTLM Authentication", false),
    unmapped("S-1-5-64", 14, "SChannel Authentication", false),
];

/// Result of looking a SID up in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownMatch {
    Mapped {
        kind: IdKind,
        id: u32,
        direction: Direction,
    },
    /// Defined but deliberately without a Unix id.
    Unmapped,
}

fn matches_sid(wk: &WellKnown, sid: &Sid) -> bool {
    wk.rid == sid.rid && sid.has_prefix(wk.prefix)
}

/// Look up the Unix id for a SID.
///
/// `None` means the SID is not well-known and normal resolution applies.
/// Entries of the wrong kind for a uid or gid request are skipped, as are
/// entries that only map unix-to-windows.
pub fn lookup_by_sid(sid: &Sid, wanted: IdType) -> Option<WellKnownMatch> {
    for wk in WELL_KNOWN.iter().filter(|wk| matches_sid(wk, sid)) {
        let Some(id) = wk.id else {
            return Some(WellKnownMatch::Unmapped);
        };
        if wk.direction == Direction::U2w {
            continue;
        }
        let kind = wk.kind();
        let wanted_ok = match wanted {
            IdType::Uid => kind == IdKind::Uid,
            IdType::Gid => kind == IdKind::Gid,
            IdType::PosixId => true,
            IdType::Sid => false,
        };
        if !wanted_ok {
            continue;
        }
        return Some(WellKnownMatch::Mapped {
            kind,
            id,
            direction: wk.direction,
        });
    }
    None
}

/// Find the well-known identity a Unix id maps back to.
pub fn lookup_by_id(kind: IdKind, id: u32) -> Option<&'static WellKnown> {
    WELL_KNOWN
        .iter()
        .find(|wk| wk.id == Some(id) && wk.kind() == kind && wk.direction != Direction::W2u)
}

/// Case-insensitive lookup by display name.
pub fn lookup_by_name(name: &str) -> Option<&'static WellKnown> {
    WELL_KNOWN.iter().find(|wk| wk.name.eq_ignore_ascii_case(name))
}

/// Name and account type of a well-known SID.
pub fn lookup_name_by_sid(sid: &Sid) -> Option<&'static WellKnown> {
    WELL_KNOWN.iter().find(|wk| matches_sid(wk, sid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_entries_report_unmapped() {
        for wk in WELL_KNOWN.iter().filter(|wk| wk.id.is_none()) {
            for wanted in [IdType::Uid, IdType::Gid, IdType::PosixId] {
                assert_eq!(
                    lookup_by_sid(&wk.sid(), wanted),
                    Some(WellKnownMatch::Unmapped),
                    "{} as {:?}",
                    wk.name,
                    wanted
                );
            }
        }
    }

    #[test]
    fn test_mapped_entry_respects_kind() {
        let owner = Sid::new("S-1-3", 0);
        assert_eq!(
            lookup_by_sid(&owner, IdType::PosixId),
            Some(WellKnownMatch::Mapped {
                kind: IdKind::Uid,
                id: WK_CREATOR_OWNER_UID,
                direction: Direction::Bi,
            })
        );
        assert_eq!(lookup_by_sid(&owner, IdType::Gid), None);
    }

    #[test]
    fn test_prefix_match_is_case_insensitive() {
        let sid = Sid::new("s-1-5", 18);
        assert!(matches!(
            lookup_by_sid(&sid, IdType::Gid),
            Some(WellKnownMatch::Mapped { id: WK_LOCAL_SYSTEM_GID, .. })
        ));
    }

    #[test]
    fn test_unknown_sid() {
        assert_eq!(lookup_by_sid(&Sid::new("S-1-5-21-1-2-3", 500), IdType::Uid), None);
    }

    #[test]
    fn test_reverse_and_name_lookups() {
        let wk = lookup_by_id(IdKind::Gid, GID_NOBODY).unwrap();
        assert_eq!(wk.name, "Anonymous Logon");
        assert!(lookup_by_id(IdKind::Uid, GID_NOBODY).is_none());

        let wk = lookup_by_name("local system").unwrap();
        assert_eq!(wk.sid(), Sid::new("S-1-5", 18));
        assert!(lookup_by_name("nobody").is_none());
    }
}
