//! Local account SIDs.
//!
//! Accounts that only exist on this host get SIDs under the configured
//! machine SID: users at `uid + 1000`, groups at `gid + 2^31`.

use crate::errors::MapError;
use crate::models::{IdKind, IdType, EPHEMERAL_MIN};
use crate::sid::Sid;

pub const LOCAL_UID_BASE: u32 = 1000;
pub const LOCAL_GID_BASE: u32 = EPHEMERAL_MIN;

/// SID for a local uid or gid. `NoMapping` if the id has no room in the rid
/// space.
pub fn encode(machine_sid: &str, kind: IdKind, id: u32) -> Result<Sid, MapError> {
    let rid = match kind {
        IdKind::Uid if id < LOCAL_GID_BASE - LOCAL_UID_BASE => id + LOCAL_UID_BASE,
        IdKind::Gid if id < LOCAL_GID_BASE => id + LOCAL_GID_BASE,
        _ => return Err(MapError::NoMapping),
    };
    Ok(Sid::new(machine_sid, rid))
}

/// Inverse of [`encode`] for a SID already known to be under the machine
/// SID.
pub fn decode(sid: &Sid, wanted: IdType) -> Result<(IdKind, u32), MapError> {
    let (kind, id) = if sid.rid >= LOCAL_GID_BASE {
        (IdKind::Gid, sid.rid - LOCAL_GID_BASE)
    } else if sid.rid >= LOCAL_UID_BASE {
        (IdKind::Uid, sid.rid - LOCAL_UID_BASE)
    } else {
        return Err(MapError::NotFound);
    };
    match (wanted, kind) {
        (IdType::Uid, IdKind::Gid) => Err(MapError::NotUser),
        (IdType::Gid, IdKind::Uid) => Err(MapError::NotGroup),
        (IdType::Sid, _) => Err(MapError::Unsupported("SID requested as unix id".into())),
        _ => Ok((kind, id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MACHINE: &str = "S-1-5-21-100-200-300";

    #[test]
    fn test_encode() {
        assert_eq!(encode(MACHINE, IdKind::Uid, 0).unwrap().rid, 1000);
        assert_eq!(encode(MACHINE, IdKind::Gid, 10).unwrap().rid, 2_147_483_658);
        assert_eq!(
            encode(MACHINE, IdKind::Uid, EPHEMERAL_MIN - 1000),
            Err(MapError::NoMapping)
        );
        assert!(encode(MACHINE, IdKind::Uid, EPHEMERAL_MIN - 1001).is_ok());
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode(&Sid::new(MACHINE, 2001), IdType::PosixId),
            Ok((IdKind::Uid, 1001))
        );
        assert_eq!(
            decode(&Sid::new(MACHINE, LOCAL_GID_BASE + 50), IdType::Gid),
            Ok((IdKind::Gid, 50))
        );
        assert_eq!(decode(&Sid::new(MACHINE, 500), IdType::Uid), Err(MapError::NotFound));
        assert_eq!(
            decode(&Sid::new(MACHINE, LOCAL_GID_BASE), IdType::Uid),
            Err(MapError::NotUser)
        );
        assert_eq!(decode(&Sid::new(MACHINE, 1000), IdType::Gid), Err(MapError::NotGroup));
    }

    #[test]
    fn test_round_trip_through_sid() {
        for (kind, id) in [(IdKind::Uid, 0), (IdKind::Uid, 4242), (IdKind::Gid, 0), (IdKind::Gid, 77)] {
            let sid = encode(MACHINE, kind, id).unwrap();
            assert_eq!(decode(&sid, IdType::PosixId), Ok((kind, id)));
        }
    }
}
