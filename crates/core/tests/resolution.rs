//! End-to-end resolution tests.
//!
//! These run the real `WorkerContext` passes against in-memory or on-disk
//! SQLite stores, with a fixed directory, a fixed name service and a
//! counting id authority in place of the external collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sidmap_core::db::cache::{now_ts, Expiry, IdMapping};
use sidmap_core::directory::StaticDirectory;
use sidmap_core::engine::{Engine, EngineSettings, WorkerContext};
use sidmap_core::ephemeral::{EphemeralAllocator, IdAuthority, SequentialIdAuthority};
use sidmap_core::errors::{ConflictKind, MapError};
use sidmap_core::models::{
    Direction, IdKind, IdType, Identity, MappingRequest, NameType, RequestFlags, EPHEMERAL_MIN,
    UID_NOBODY,
};
use sidmap_core::nameservice::StaticNameService;
use sidmap_core::rules::NameRule;
use sidmap_core::service::{Batch, WorkerPool};
use sidmap_core::wellknown::{WK_LOCAL_SYSTEM_GID, WK_MAX_UID};
use sidmap_core::Sid;

// ===========================================================================
// Helpers
// ===========================================================================

const DOMAIN: &str = "S-1-5-21-7-8-9";
const MACHINE_SID: &str = "S-1-5-21-100-200-300";

fn sid(rid: u32) -> Sid {
    Sid::new(DOMAIN, rid)
}

struct CountingAuthority {
    inner: SequentialIdAuthority,
    calls: AtomicUsize,
}

impl IdAuthority for CountingAuthority {
    fn allocate_block(&self, kind: IdKind, count: u32) -> Result<u32, MapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate_block(kind, count)
    }
}

struct Fixture {
    ctx: WorkerContext,
    directory: Arc<StaticDirectory>,
    authority: Arc<CountingAuthority>,
}

impl Fixture {
    fn allocations(&self) -> usize {
        self.authority.calls.load(Ordering::SeqCst)
    }
}

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_entry(sid(1104), "alice", "CORP", NameType::User)
        .with_entry(sid(1105), "bob", "CORP", NameType::User)
        .with_entry(sid(1500), "foo", "CORP", NameType::User)
        .with_entry(sid(1600), "robert", "CORP", NameType::User)
        .with_entry(sid(5000), "zed", "CORP", NameType::User)
        .with_entry(sid(6000), "carol", "CORP", NameType::User)
        .with_entry(sid(513), "Domain Users", "CORP", NameType::Group)
}

fn names() -> StaticNameService {
    StaticNameService::new()
        .with_user("bob", 1001)
        .with_user("carl", 1003)
        .with_group("staff", 50)
}

fn settings() -> EngineSettings {
    EngineSettings {
        machine_sid: Some(MACHINE_SID.into()),
        mapping_domain: Some("CORP".into()),
        ..EngineSettings::default()
    }
}

fn build_engine(
    settings: EngineSettings,
    dir: StaticDirectory,
) -> (Arc<Engine>, Arc<StaticDirectory>, Arc<CountingAuthority>) {
    let directory = Arc::new(dir);
    let authority = Arc::new(CountingAuthority {
        inner: SequentialIdAuthority::new(),
        calls: AtomicUsize::new(0),
    });
    let engine = Engine::new(
        settings,
        EphemeralAllocator::new(authority.clone(), 16),
        directory.clone(),
        Arc::new(names()),
    );
    (Arc::new(engine), directory, authority)
}

fn fixture_with(settings: EngineSettings, dir: StaticDirectory) -> Fixture {
    let (engine, directory, authority) = build_engine(settings, dir);
    Fixture {
        ctx: WorkerContext::open(engine).expect("open worker context"),
        directory,
        authority,
    }
}

fn fixture() -> Fixture {
    fixture_with(settings(), directory())
}

fn uid_request(sid: Sid) -> MappingRequest {
    MappingRequest::sid_to_id(sid, IdType::Uid)
}

/// carol's cache row holding an ephemeral uid that has expired.
fn expired_carol(pid: u32) -> IdMapping {
    IdMapping {
        sid: sid(6000),
        windomain: Some("CORP".into()),
        winname: Some("carol".into()),
        kind: IdKind::Uid,
        pid,
        unixname: None,
        direction: Direction::Bi,
        expiry: Expiry::At(now_ts() - 10),
    }
}

// ===========================================================================
// SID to id
// ===========================================================================

#[test]
fn test_unmapped_well_known_sid_is_not_found() {
    let f = fixture();
    let results = f.ctx.map_sids_to_ids(&[
        MappingRequest::sid_to_id(Sid::new("S-1-5", 20), IdType::PosixId),
        MappingRequest::sid_to_id(Sid::new("S-1-1", 0), IdType::Gid),
    ]);
    for result in &results {
        assert_eq!(result.status, Err(MapError::NotFound));
    }
    assert_eq!(f.allocations(), 0);
    assert_eq!(f.directory.batches(), 0);
}

#[test]
fn test_mapped_well_known_sid() {
    let f = fixture();
    let results = f
        .ctx
        .map_sids_to_ids(&[MappingRequest::sid_to_id(Sid::new("S-1-5", 18), IdType::PosixId)]);
    assert_eq!(results[0].status, Ok(()));
    assert_eq!(results[0].id, Some(Identity::Gid(WK_LOCAL_SYSTEM_GID)));
}

#[test]
fn test_deny_rule_wins_over_later_rule() {
    let f = fixture();
    f.ctx
        .add_rule(&NameRule::new(true, "foo", Some("CORP"), "", Direction::W2u))
        .unwrap();
    f.ctx
        .add_rule(&NameRule::new(true, "foo", Some("CORP"), "bob", Direction::W2u))
        .unwrap();

    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(1500))]);
    assert_eq!(results[0].status, Err(MapError::NoMapping));
    assert_eq!(f.allocations(), 0);
}

#[test]
fn test_literal_rule_maps_to_local_account() {
    let f = fixture();
    f.ctx
        .add_rule(&NameRule::new(true, "robert", Some("CORP"), "bob", Direction::Bi))
        .unwrap();

    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(1600))]);
    assert_eq!(results[0].status, Ok(()));
    assert_eq!(results[0].id, Some(Identity::Uid(1001)));
    assert_eq!(results[0].name.as_deref(), Some("bob"));
    assert_eq!(results[0].direction, Direction::Bi);

    // The directory answer was cached along with the mapping.
    let cached = f.ctx.cache().lookup_name_by_sid(&sid(1600)).unwrap();
    assert_eq!(cached.name, "robert");
    let hit = f.ctx.cache().lookup_id_by_sid(&sid(1600), IdType::Uid).unwrap();
    assert_eq!(hit.id, 1001);
}

#[test]
fn test_wildcard_rule_falls_through_to_ephemeral() {
    let f = fixture();
    f.ctx
        .add_rule(&NameRule::new(true, "*", Some("CORP"), "*", Direction::W2u))
        .unwrap();

    // alice has no local account, so the self-referencing rule does not
    // apply and an ephemeral uid is minted.
    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(1104))]);
    assert_eq!(results[0].status, Ok(()));
    let (kind, id) = results[0].unix_id().unwrap();
    assert_eq!(kind, IdKind::Uid);
    assert_eq!(id, WK_MAX_UID + 1);
    assert_eq!(results[0].direction, Direction::Bi);

    // bob does have one.
    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(1105))]);
    assert_eq!(results[0].id, Some(Identity::Uid(1001)));
    assert_eq!(results[0].direction, Direction::W2u);
}

#[test]
fn test_ephemeral_ids_are_shared_within_and_across_batches() {
    let f = fixture();
    let results = f
        .ctx
        .map_sids_to_ids(&[uid_request(sid(5000)), uid_request(sid(5000))]);
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(results[0].id, results[1].id);
    let (_, first) = results[0].unix_id().unwrap();
    assert!(first >= EPHEMERAL_MIN);
    // One directory query for the two items.
    assert_eq!(f.directory.items(), 1);

    let later = f.ctx.map_sids_to_ids(&[uid_request(sid(5000))]);
    assert_eq!(later[0].id, Some(Identity::Uid(first)));
    assert_eq!(f.allocations(), 1);
    assert_eq!(f.directory.batches(), 1);
}

#[test]
fn test_cached_mapping_needs_no_allocation() {
    let f = fixture();
    f.ctx
        .cache()
        .upsert_id_mapping(&IdMapping {
            sid: sid(4242),
            windomain: Some("CORP".into()),
            winname: Some("dave".into()),
            kind: IdKind::Uid,
            pid: 5001,
            unixname: Some("dave".into()),
            direction: Direction::Bi,
            expiry: Expiry::after(now_ts(), 600),
        })
        .unwrap();

    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(4242))]);
    assert_eq!(results[0].id, Some(Identity::Uid(5001)));
    assert_eq!(f.allocations(), 0);
    assert_eq!(f.directory.batches(), 0);
}

#[test]
fn test_expired_ephemeral_id_is_reused() {
    let f = fixture();
    let old = EPHEMERAL_MIN + 5;
    f.ctx
        .cache()
        .upsert_id_mapping(&IdMapping {
            sid: sid(6000),
            windomain: Some("CORP".into()),
            winname: Some("carol".into()),
            kind: IdKind::Uid,
            pid: old,
            unixname: None,
            direction: Direction::Bi,
            expiry: Expiry::At(now_ts() - 10),
        })
        .unwrap();

    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(6000))]);
    assert_eq!(results[0].id, Some(Identity::Uid(old)));
    assert_eq!(f.allocations(), 0);
    // Revalidated through the directory.
    assert_eq!(f.directory.batches(), 1);
}

#[test]
fn test_expired_ephemeral_id_superseded_by_rule() {
    let f = fixture();
    let old = EPHEMERAL_MIN + 5;
    f.ctx
        .cache()
        .upsert_id_mapping(&IdMapping {
            sid: sid(6000),
            windomain: Some("CORP".into()),
            winname: Some("carol".into()),
            kind: IdKind::Uid,
            pid: old,
            unixname: None,
            direction: Direction::Bi,
            expiry: Expiry::At(now_ts() - 10),
        })
        .unwrap();
    f.ctx
        .add_rule(&NameRule::new(true, "carol", Some("CORP"), "carl", Direction::W2u))
        .unwrap();

    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(6000))]);
    assert_eq!(results[0].id, Some(Identity::Uid(1003)));

    let hit = f.ctx.cache().lookup_id_by_sid(&sid(6000), IdType::Uid).unwrap();
    assert_eq!(hit.id, 1003);
    // The old id still maps back to the SID.
    let back = f.ctx.cache().lookup_sid_by_id(IdKind::Uid, old).unwrap();
    assert_eq!(back.sid, sid(6000));
}

#[test]
fn test_expired_ephemeral_id_with_lookups_suppressed() {
    let f = fixture();
    let old = EPHEMERAL_MIN + 5;
    f.ctx.cache().upsert_id_mapping(&expired_carol(old)).unwrap();

    let no_directory = RequestFlags {
        no_new_id_alloc: false,
        no_directory: true,
    };
    let no_alloc = RequestFlags {
        no_new_id_alloc: true,
        no_directory: false,
    };
    let results = f.ctx.map_sids_to_ids(&[
        uid_request(sid(6000)).with_flags(no_directory),
        uid_request(sid(6000)).with_flags(no_alloc),
        MappingRequest::sid_to_id(sid(6000), IdType::Gid).with_flags(no_directory),
        MappingRequest::sid_to_id(sid(6000), IdType::Gid).with_flags(no_alloc),
    ]);

    // The stale uid is all there is, and it is handed back as is.
    assert_eq!(results[0].status, Ok(()));
    assert_eq!(results[0].id, Some(Identity::Uid(old)));
    assert_eq!(results[1].id, Some(Identity::Uid(old)));
    // A group request never gets that uid back.
    for result in &results[2..] {
        assert_eq!(result.status, Err(MapError::NotGroup));
        assert_ne!(result.id, Some(Identity::Uid(old)));
    }
    assert_eq!(f.directory.batches(), 0);
    assert_eq!(f.allocations(), 0);
}

#[test]
fn test_unresolved_sid_gets_ephemeral_id() {
    let f = fixture();
    let results = f.ctx.map_sids_to_ids(&[
        uid_request(sid(7777)),
        MappingRequest::sid_to_id(sid(7778), IdType::Gid),
        MappingRequest::sid_to_id(sid(7779), IdType::PosixId),
    ]);
    assert!(results.iter().all(|r| r.is_success()));
    let kinds: Vec<IdKind> = results.iter().filter_map(|r| r.unix_id()).map(|(k, _)| k).collect();
    assert_eq!(kinds, vec![IdKind::Uid, IdKind::Gid, IdKind::Uid]);
    let (_, uid) = results[0].unix_id().unwrap();
    assert!(uid >= EPHEMERAL_MIN);
    assert_eq!(results[0].direction, Direction::Bi);

    // Cached without a Windows name, so the next batch needs no directory.
    assert!(f.ctx.cache().lookup_name_by_sid(&sid(7777)).is_err());
    let again = f.ctx.map_sids_to_ids(&[uid_request(sid(7777))]);
    assert_eq!(again[0].id, Some(Identity::Uid(uid)));
    assert_eq!(f.directory.batches(), 1);

    let back = f.ctx.map_ids_to_sids(&[MappingRequest::id_to_sid(IdKind::Uid, uid)]);
    assert_eq!(back[0].sid(), Some(&sid(7777)));
}

#[test]
fn test_unresolved_sid_fails_when_ephemeral_mapping_is_off() {
    let settings = EngineSettings {
        ephemeral_unresolved_sids: false,
        ..settings()
    };
    let f = fixture_with(settings, directory());
    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(7777))]);
    assert_eq!(results[0].status, Err(MapError::NotFound));
    assert_eq!(results[0].id, Some(Identity::Uid(UID_NOBODY)));
    assert_eq!(f.allocations(), 0);
}

#[test]
fn test_type_mismatch_from_directory() {
    let f = fixture();
    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(513))]);
    assert_eq!(results[0].status, Err(MapError::NotUser));
    assert_eq!(results[0].id, Some(Identity::Uid(UID_NOBODY)));
}

#[test]
fn test_no_allocation_flag_on_cache_miss() {
    let f = fixture();
    let request = uid_request(sid(5000)).with_flags(RequestFlags {
        no_new_id_alloc: true,
        no_directory: false,
    });
    let results = f.ctx.map_sids_to_ids(&[request]);
    assert_eq!(results[0].status, Err(MapError::NotFound));
    assert_eq!(results[0].id, Some(Identity::Uid(UID_NOBODY)));
    assert_eq!(f.directory.batches(), 0);
}

#[test]
fn test_local_sid_decodes_without_directory() {
    let f = fixture();
    let local = Sid::new(MACHINE_SID, 2001);
    let results = f.ctx.map_sids_to_ids(&[uid_request(local.clone())]);
    assert_eq!(results[0].status, Ok(()));
    assert_eq!(results[0].id, Some(Identity::Uid(1001)));

    let hit = f.ctx.cache().lookup_id_by_sid(&local, IdType::Uid).unwrap();
    assert_eq!(hit.id, 1001);
    assert!(f.ctx.cache().lookup_name_by_sid(&local).is_err());
}

#[test]
fn test_directory_timeout_fails_only_its_item() {
    let f = fixture_with(settings(), directory().with_timeout(sid(5000)));
    let results = f.ctx.map_sids_to_ids(&[
        uid_request(sid(5000)),
        uid_request(sid(1104)),
        MappingRequest::sid_to_id(Sid::new("S-1-5", 18), IdType::Gid),
    ]);
    assert!(matches!(results[0].status, Err(MapError::RetriableDirectory(_))));
    assert!(results[1].is_success());
    assert!(results[2].is_success());
}

#[test]
fn test_transient_directory_failures_are_retried() {
    let f = fixture_with(settings(), directory().with_transient_failures(2));
    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(5000))]);
    assert!(results[0].is_success());
    assert_eq!(f.directory.batches(), 3);
}

#[test]
fn test_bad_sid_input() {
    let f = fixture();
    let results = f.ctx.map_sids_to_ids(&[MappingRequest::id_to_sid(IdKind::Uid, 7)]);
    assert!(matches!(results[0].status, Err(MapError::SidFormat(_))));
}

// ===========================================================================
// Id to SID
// ===========================================================================

#[test]
fn test_id_to_sid_through_rule() {
    let f = fixture();
    f.ctx
        .add_rule(&NameRule::new(true, "robert", Some("CORP"), "bob", Direction::U2w))
        .unwrap();

    let results = f.ctx.map_ids_to_sids(&[MappingRequest::id_to_sid(IdKind::Uid, 1001)]);
    assert_eq!(results[0].status, Ok(()));
    assert_eq!(results[0].sid(), Some(&sid(1600)));
    assert_eq!(results[0].name.as_deref(), Some("robert"));
    assert_eq!(results[0].domain.as_deref(), Some("CORP"));
    assert_eq!(results[0].direction, Direction::U2w);

    let back = f.ctx.cache().lookup_sid_by_id(IdKind::Uid, 1001).unwrap();
    assert_eq!(back.sid, sid(1600));
    assert!(f.ctx.cache().lookup_name_by_sid(&sid(1600)).is_ok());
}

#[test]
fn test_id_to_sid_local_fallback() {
    let f = fixture();
    let results = f.ctx.map_ids_to_sids(&[
        MappingRequest::id_to_sid(IdKind::Uid, 1003),
        MappingRequest::id_to_sid(IdKind::Gid, 50),
        MappingRequest::id_to_sid(IdKind::Uid, 4000),
    ]);
    assert_eq!(results[0].sid(), Some(&Sid::new(MACHINE_SID, 2003)));
    assert_eq!(results[1].sid(), Some(&Sid::new(MACHINE_SID, EPHEMERAL_MIN + 50)));
    // Unknown to the name service: still a local SID.
    assert_eq!(results[2].sid(), Some(&Sid::new(MACHINE_SID, 5000)));
    assert!(results.iter().all(|r| r.is_success()));
}

#[test]
fn test_id_to_sid_rule_for_other_domain() {
    let f = fixture();
    // The directory's alice lives in CORP, not OTHER.
    f.ctx
        .add_rule(&NameRule::new(true, "alice", Some("OTHER"), "carl", Direction::U2w))
        .unwrap();

    let results = f.ctx.map_ids_to_sids(&[MappingRequest::id_to_sid(IdKind::Uid, 1003)]);
    assert_ne!(results[0].sid(), Some(&sid(1104)));
    assert_eq!(results[0].sid(), Some(&Sid::new(MACHINE_SID, 2003)));
    assert_eq!(results[0].name, None);
}

#[test]
fn test_id_to_sid_deny_keeps_local_sid() {
    let f = fixture();
    f.ctx
        .add_rule(&NameRule::new(true, "", Some("CORP"), "carl", Direction::U2w))
        .unwrap();

    let results = f.ctx.map_ids_to_sids(&[MappingRequest::id_to_sid(IdKind::Uid, 1003)]);
    assert_eq!(results[0].status, Err(MapError::NoMapping));
    assert_eq!(results[0].sid(), Some(&Sid::new(MACHINE_SID, 2003)));
    // A failed item is not cached.
    assert!(f.ctx.cache().lookup_sid_by_id(IdKind::Uid, 1003).is_err());
}

#[test]
fn test_id_to_sid_without_machine_sid() {
    let settings = EngineSettings {
        machine_sid: None,
        ..settings()
    };
    let f = fixture_with(settings, directory());
    let results = f.ctx.map_ids_to_sids(&[MappingRequest::id_to_sid(IdKind::Uid, 1003)]);
    assert_eq!(results[0].status, Err(MapError::NoMapping));
}

#[test]
fn test_ephemeral_id_without_cache_row() {
    let f = fixture();
    let results = f
        .ctx
        .map_ids_to_sids(&[MappingRequest::id_to_sid(IdKind::Uid, EPHEMERAL_MIN + 99)]);
    assert_eq!(results[0].status, Err(MapError::NoMapping));
}

#[test]
fn test_ephemeral_id_maps_back() {
    let f = fixture();
    let results = f.ctx.map_sids_to_ids(&[uid_request(sid(5000))]);
    let (_, id) = results[0].unix_id().unwrap();

    let back = f.ctx.map_ids_to_sids(&[MappingRequest::id_to_sid(IdKind::Uid, id)]);
    assert_eq!(back[0].sid(), Some(&sid(5000)));
}

// ===========================================================================
// Names and rules
// ===========================================================================

#[test]
fn test_conflicting_rule_is_reported() {
    let f = fixture();
    let rule = NameRule::new(true, "bob", Some("CORP"), "bob", Direction::W2u);
    f.ctx.add_rule(&rule).unwrap();
    assert_eq!(
        f.ctx.add_rule(&rule),
        Err(MapError::ConfigConflict(ConflictKind::W2u))
    );
    assert_eq!(f.ctx.list_rules(Some(true)).unwrap().len(), 1);
    assert_eq!(f.ctx.flush_rules(true).unwrap(), 1);
    assert!(f.ctx.list_rules(None).unwrap().is_empty());
}

#[test]
fn test_resolve_name_to_id() {
    let f = fixture();
    f.ctx
        .add_rule(&NameRule::new(true, "robert", None, "bob", Direction::W2u))
        .unwrap();

    let (found, result) = f.ctx.resolve_name_to_id("robert", None, IdType::PosixId).unwrap();
    assert_eq!(found, sid(1600));
    assert_eq!(result.id, Some(Identity::Uid(1001)));

    assert_eq!(
        f.ctx.resolve_name_to_id("Domain Users", None, IdType::Uid).unwrap_err(),
        MapError::NotUser
    );
    assert_eq!(
        f.ctx.resolve_name_to_id("alice", Some("OTHER"), IdType::Uid).unwrap_err(),
        MapError::NotFound
    );
    assert!(matches!(
        f.ctx.resolve_name_to_id("", Some("CORP"), IdType::Uid),
        Err(MapError::InvalidArgument(_))
    ));
}

#[test]
fn test_resolve_id_to_name() {
    let f = fixture();
    let result = f.ctx.resolve_id_to_name(IdKind::Gid, WK_LOCAL_SYSTEM_GID);
    assert_eq!(result.name.as_deref(), Some("Local System"));

    let result = f.ctx.resolve_id_to_name(IdKind::Uid, 1003);
    assert!(result.is_success());
    assert_eq!(result.name, None);
}

// ===========================================================================
// Worker pool
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_pool_shares_on_disk_cache() {
    let dir = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        data_dir: Some(dir.path().to_path_buf()),
        ..settings()
    };
    let (engine, directory, authority) = build_engine(settings, directory());
    let pool = WorkerPool::start(engine, 2).unwrap();

    let first = pool
        .submit(Batch::SidsToIds(vec![uid_request(sid(5000)), uid_request(sid(1104))]))
        .await
        .unwrap();
    assert!(first.iter().all(|r| r.is_success()));

    // Whichever worker takes the next batch sees the first one's writes.
    for _ in 0..4 {
        let again = pool
            .submit(Batch::SidsToIds(vec![uid_request(sid(5000))]))
            .await
            .unwrap();
        assert_eq!(again[0].id, first[0].id);
    }
    assert_eq!(directory.batches(), 1);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

    let back = pool
        .submit(Batch::IdsToSids(vec![MappingRequest::id_to_sid(IdKind::Uid, 1003)]))
        .await
        .unwrap();
    assert_eq!(back[0].sid(), Some(&Sid::new(MACHINE_SID, 2003)));

    pool.shutdown().await;
}
