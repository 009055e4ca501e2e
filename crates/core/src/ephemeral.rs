//! Ephemeral id allocation.
//!
//! Ids are handed out from a window `[next, limit)` per kind. When a window
//! runs dry the allocator asks an [`IdAuthority`] for the next block. The
//! authority call is made without holding the window lock; a separate refill
//! lock makes sure only one thread asks at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::errors::MapError;
use crate::models::{IdKind, SENTINEL_ID};
use crate::sid::Sid;
use crate::wellknown::{WK_MAX_GID, WK_MAX_UID};

pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

/// Source of blocks of ephemeral ids.
pub trait IdAuthority: Send + Sync {
    /// Reserve `count` consecutive ids of `kind` and return the first one.
    fn allocate_block(&self, kind: IdKind, count: u32) -> Result<u32, MapError>;
}

/// Hands out consecutive blocks above the ids reserved for well-known SIDs.
pub struct SequentialIdAuthority {
    next: Mutex<(u64, u64)>,
}

impl SequentialIdAuthority {
    pub fn new() -> Self {
        Self::starting_at(WK_MAX_UID + 1, WK_MAX_GID + 1)
    }

    pub fn starting_at(first_uid: u32, first_gid: u32) -> Self {
        Self {
            next: Mutex::new((first_uid as u64, first_gid as u64)),
        }
    }
}

impl Default for SequentialIdAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAuthority for SequentialIdAuthority {
    fn allocate_block(&self, kind: IdKind, count: u32) -> Result<u32, MapError> {
        let mut next = lock(&self.next);
        let slot = match kind {
            IdKind::Uid => &mut next.0,
            IdKind::Gid => &mut next.1,
        };
        let start = *slot;
        let end = start + count as u64;
        // The sentinel id is never handed out.
        if end > SENTINEL_ID as u64 {
            return Err(MapError::Allocation(format!("{kind} space exhausted")));
        }
        *slot = end;
        Ok(start as u32)
    }
}

#[derive(Debug, Default)]
struct Window {
    next: u64,
    limit: u64,
}

struct Pool {
    window: Mutex<Window>,
    refill: Mutex<()>,
}

impl Pool {
    fn new() -> Self {
        Self {
            window: Mutex::new(Window::default()),
            refill: Mutex::new(()),
        }
    }

    fn take(&self) -> Option<u32> {
        let mut w = lock(&self.window);
        if w.next < w.limit {
            let id = w.next as u32;
            w.next += 1;
            Some(id)
        } else {
            None
        }
    }
}

/// Process-wide ephemeral id allocator shared by all workers.
pub struct EphemeralAllocator {
    authority: Arc<dyn IdAuthority>,
    block_size: u32,
    uids: Pool,
    gids: Pool,
}

impl EphemeralAllocator {
    pub fn new(authority: Arc<dyn IdAuthority>, block_size: u32) -> Self {
        Self {
            authority,
            block_size: block_size.max(1),
            uids: Pool::new(),
            gids: Pool::new(),
        }
    }

    fn pool(&self, kind: IdKind) -> &Pool {
        match kind {
            IdKind::Uid => &self.uids,
            IdKind::Gid => &self.gids,
        }
    }

    /// Take the next id of `kind`, fetching a new block when the current
    /// window is exhausted.
    pub fn allocate(&self, kind: IdKind) -> Result<u32, MapError> {
        let pool = self.pool(kind);
        loop {
            if let Some(id) = pool.take() {
                return Ok(id);
            }

            let _refill = lock(&pool.refill);
            // Another thread may have refilled while we waited.
            if let Some(id) = pool.take() {
                return Ok(id);
            }

            let start = self.authority.allocate_block(kind, self.block_size).map_err(|e| {
                warn!(%kind, error = %e, "ephemeral block request failed");
                e
            })?;
            let mut w = lock(&pool.window);
            w.next = start as u64;
            w.limit = start as u64 + self.block_size as u64;
            info!(%kind, start, size = self.block_size, "new ephemeral id block");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| {
        warn!("allocator mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Ephemeral ids minted during one batch, by SID.
///
/// Two items in the same batch naming the same SID must get the same id even
/// though the cache is only written after the batch is resolved.
#[derive(Debug, Default)]
pub struct SidHistory {
    entries: HashMap<(String, u32), HistoryEntry>,
}

#[derive(Debug, Default, Clone, Copy)]
struct HistoryEntry {
    uid: Option<u32>,
    gid: Option<u32>,
}

impl SidHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sid: &Sid, kind: IdKind) -> Option<u32> {
        let entry = self.entries.get(&(sid.prefix.clone(), sid.rid))?;
        match kind {
            IdKind::Uid => entry.uid,
            IdKind::Gid => entry.gid,
        }
    }

    pub fn insert(&mut self, sid: &Sid, kind: IdKind, id: u32) {
        let entry = self.entries.entry((sid.prefix.clone(), sid.rid)).or_default();
        match kind {
            IdKind::Uid => entry.uid = Some(id),
            IdKind::Gid => entry.gid = Some(id),
        }
    }

    /// Reuse the id already minted for `sid` in this batch, or mint one.
    pub fn get_or_allocate(
        &mut self,
        sid: &Sid,
        kind: IdKind,
        allocator: &EphemeralAllocator,
    ) -> Result<u32, MapError> {
        if let Some(id) = self.get(sid, kind) {
            debug!(%sid, %kind, id, "reusing ephemeral id from this batch");
            return Ok(id);
        }
        let id = allocator.allocate(kind)?;
        self.insert(sid, kind, id);
        debug!(%sid, %kind, id, "minted ephemeral id");
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuthority {
        inner: SequentialIdAuthority,
        calls: AtomicUsize,
    }

    impl CountingAuthority {
        fn new() -> Self {
            Self {
                inner: SequentialIdAuthority::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl IdAuthority for CountingAuthority {
        fn allocate_block(&self, kind: IdKind, count: u32) -> Result<u32, MapError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.allocate_block(kind, count)
        }
    }

    struct FailingAuthority;

    impl IdAuthority for FailingAuthority {
        fn allocate_block(&self, _kind: IdKind, _count: u32) -> Result<u32, MapError> {
            Err(MapError::Allocation("authority offline".into()))
        }
    }

    #[test]
    fn test_window_rollover() {
        let authority = Arc::new(CountingAuthority::new());
        let allocator = EphemeralAllocator::new(authority.clone(), DEFAULT_BLOCK_SIZE);

        let first = allocator.allocate(IdKind::Uid).unwrap();
        assert_eq!(first, WK_MAX_UID + 1);
        for i in 1..DEFAULT_BLOCK_SIZE {
            assert_eq!(allocator.allocate(IdKind::Uid).unwrap(), first + i);
        }
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

        // 8193rd allocation: exactly one more block, no gap.
        assert_eq!(allocator.allocate(IdKind::Uid).unwrap(), first + DEFAULT_BLOCK_SIZE);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kinds_are_independent() {
        let allocator = EphemeralAllocator::new(Arc::new(SequentialIdAuthority::new()), 4);
        assert_eq!(allocator.allocate(IdKind::Uid).unwrap(), WK_MAX_UID + 1);
        assert_eq!(allocator.allocate(IdKind::Gid).unwrap(), WK_MAX_GID + 1);
        assert_eq!(allocator.allocate(IdKind::Uid).unwrap(), WK_MAX_UID + 2);
    }

    #[test]
    fn test_authority_failure_is_per_request() {
        let allocator = EphemeralAllocator::new(Arc::new(FailingAuthority), 4);
        assert!(matches!(allocator.allocate(IdKind::Uid), Err(MapError::Allocation(_))));
    }

    #[test]
    fn test_exhausted_space() {
        let authority = SequentialIdAuthority::starting_at(SENTINEL_ID - 2, WK_MAX_GID + 1);
        assert!(authority.allocate_block(IdKind::Uid, 2).is_ok());
        assert!(authority.allocate_block(IdKind::Uid, 1).is_err());
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let authority = Arc::new(CountingAuthority::new());
        let allocator = Arc::new(EphemeralAllocator::new(authority.clone(), 16));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| allocator.allocate(IdKind::Gid).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_sid_history_dedup() {
        let allocator = EphemeralAllocator::new(Arc::new(SequentialIdAuthority::new()), 8);
        let mut history = SidHistory::new();
        let sid = Sid::new("S-1-5-21-1-2-3", 5000);

        let a = history.get_or_allocate(&sid, IdKind::Uid, &allocator).unwrap();
        let b = history.get_or_allocate(&sid, IdKind::Uid, &allocator).unwrap();
        assert_eq!(a, b);

        let g = history.get_or_allocate(&sid, IdKind::Gid, &allocator).unwrap();
        assert_eq!(history.get(&sid, IdKind::Gid), Some(g));
        assert_eq!(history.len(), 1);

        let other = history
            .get_or_allocate(&Sid::new("S-1-5-21-1-2-3", 5001), IdKind::Uid, &allocator)
            .unwrap();
        assert_ne!(other, a);
    }
}
