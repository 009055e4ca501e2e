//! Directory lookups (SID to name and name to SID).
//!
//! A [`DirectoryClient`] resolves a batch of queries in one round trip. Any
//! enqueue may fail with a transient error, in which case the whole batch is
//! abandoned and started again; [`run_queries`] does that up to
//! [`MAX_ATTEMPTS`] times, re-sending only the items that are not resolved
//! yet.

pub mod ldap;

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::errors::{DirectoryError, MapError};
use crate::models::NameType;
use crate::sid::Sid;

pub use ldap::LdapDirectory;

/// Initial try plus two retries.
pub const MAX_ATTEMPTS: usize = 3;

/// A resolved directory object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub sid: Sid,
    pub name: String,
    pub domain: String,
    pub name_type: NameType,
}

/// One lookup in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Sid2Name(Sid),
    Name2Sid { name: String, domain: String },
}

/// Per-item answer from [`DirectoryBatch::end`].
pub type ItemResult = Result<DirectoryEntry, DirectoryError>;

/// Batched directory access.
pub trait DirectoryClient: Send + Sync {
    fn start_batch(&self, capacity: usize) -> Result<Box<dyn DirectoryBatch + '_>, DirectoryError>;
}

/// An open batch. Results come back in enqueue order.
pub trait DirectoryBatch {
    fn add_sid2name(&mut self, sid: &Sid) -> Result<(), DirectoryError>;

    fn add_name2sid(&mut self, name: &str, domain: &str) -> Result<(), DirectoryError>;

    fn end(self: Box<Self>) -> Result<Vec<ItemResult>, DirectoryError>;
}

/// Resolve `queries` with retry. The output is index-aligned with the input.
pub fn run_queries(client: &dyn DirectoryClient, queries: &[Query]) -> Vec<Result<DirectoryEntry, MapError>> {
    let mut results: Vec<Option<ItemResult>> = vec![None; queries.len()];

    for attempt in 1..=MAX_ATTEMPTS {
        let pending: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| match r {
                None => true,
                Some(Err(e)) => e.is_transient(),
                Some(Ok(_)) => false,
            })
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            break;
        }

        debug!(attempt, items = pending.len(), "directory round");
        match run_once(client, queries, &pending) {
            Ok(outcomes) => {
                for (i, outcome) in pending.into_iter().zip(outcomes) {
                    results[i] = Some(outcome);
                }
            }
            Err(e) if e.is_transient() => {
                warn!(attempt, error = %e, "directory batch failed, retrying");
                for i in pending {
                    results[i] = Some(Err(e.clone()));
                }
            }
            Err(e) => {
                warn!(error = %e, "directory batch failed");
                for i in pending {
                    results[i] = Some(Err(e.clone()));
                }
                break;
            }
        }
    }

    results
        .into_iter()
        .map(|r| match r {
            Some(outcome) => outcome.map_err(MapError::from),
            None => Err(MapError::NotFound),
        })
        .collect()
}

fn run_once(
    client: &dyn DirectoryClient,
    queries: &[Query],
    pending: &[usize],
) -> Result<Vec<ItemResult>, DirectoryError> {
    let mut batch = client.start_batch(pending.len())?;
    for &i in pending {
        match &queries[i] {
            Query::Sid2Name(sid) => batch.add_sid2name(sid)?,
            Query::Name2Sid { name, domain } => batch.add_name2sid(name, domain)?,
        }
    }
    let outcomes = batch.end()?;
    if outcomes.len() != pending.len() {
        return Err(DirectoryError::Malformed(format!(
            "{} results for {} queries",
            outcomes.len(),
            pending.len()
        )));
    }
    Ok(outcomes)
}

/// Resolve several SIDs in one round.
pub fn lookup_sids(client: &dyn DirectoryClient, sids: &[Sid]) -> Vec<Result<DirectoryEntry, MapError>> {
    let queries: Vec<Query> = sids.iter().cloned().map(Query::Sid2Name).collect();
    run_queries(client, &queries)
}

/// Look up a single SID.
pub fn lookup_sid(client: &dyn DirectoryClient, sid: &Sid) -> Result<DirectoryEntry, MapError> {
    single(run_queries(client, &[Query::Sid2Name(sid.clone())]))
}

/// Look up a single `name@domain`.
pub fn lookup_name(
    client: &dyn DirectoryClient,
    name: &str,
    domain: &str,
) -> Result<DirectoryEntry, MapError> {
    single(run_queries(
        client,
        &[Query::Name2Sid {
            name: name.to_string(),
            domain: domain.to_string(),
        }],
    ))
}

fn single(mut results: Vec<Result<DirectoryEntry, MapError>>) -> Result<DirectoryEntry, MapError> {
    results.pop().unwrap_or(Err(MapError::NotFound))
}

// ---------------------------------------------------------------------------
// No directory
// ---------------------------------------------------------------------------

/// Used when no directory is configured: every lookup is `NotFound`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDirectory;

struct NoBatch {
    items: usize,
}

impl DirectoryClient for NoDirectory {
    fn start_batch(&self, _capacity: usize) -> Result<Box<dyn DirectoryBatch + '_>, DirectoryError> {
        Ok(Box::new(NoBatch { items: 0 }))
    }
}

impl DirectoryBatch for NoBatch {
    fn add_sid2name(&mut self, _sid: &Sid) -> Result<(), DirectoryError> {
        self.items += 1;
        Ok(())
    }

    fn add_name2sid(&mut self, _name: &str, _domain: &str) -> Result<(), DirectoryError> {
        self.items += 1;
        Ok(())
    }

    fn end(self: Box<Self>) -> Result<Vec<ItemResult>, DirectoryError> {
        Ok(vec![Err(DirectoryError::NotFound); self.items])
    }
}

// ---------------------------------------------------------------------------
// Fixed table
// ---------------------------------------------------------------------------

/// Directory backed by a fixed set of entries, for offline deployments and
/// tests. Transient enqueue failures and per-item timeouts can be injected.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: Vec<DirectoryEntry>,
    timeouts: Vec<Sid>,
    transient_failures: AtomicUsize,
    batches: AtomicUsize,
    items: AtomicUsize,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, sid: Sid, name: &str, domain: &str, name_type: NameType) -> Self {
        self.entries.push(DirectoryEntry {
            sid,
            name: name.to_string(),
            domain: domain.to_string(),
            name_type,
        });
        self
    }

    /// Make lookups of `sid` time out.
    pub fn with_timeout(mut self, sid: Sid) -> Self {
        self.timeouts.push(sid);
        self
    }

    /// Fail the next `n` enqueue calls with a transient error.
    pub fn with_transient_failures(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Number of batches started so far.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Number of items enqueued so far, across all batches.
    pub fn items(&self) -> usize {
        self.items.load(Ordering::SeqCst)
    }

    fn resolve(&self, query: &Query) -> ItemResult {
        match query {
            Query::Sid2Name(sid) => {
                if self.timeouts.contains(sid) {
                    return Err(DirectoryError::Timeout);
                }
                self.entries
                    .iter()
                    .find(|e| &e.sid == sid)
                    .cloned()
                    .ok_or(DirectoryError::NotFound)
            }
            Query::Name2Sid { name, domain } => self
                .entries
                .iter()
                .find(|e| e.name.eq_ignore_ascii_case(name) && e.domain.eq_ignore_ascii_case(domain))
                .cloned()
                .ok_or(DirectoryError::NotFound),
        }
    }

    fn enqueue(&self) -> Result<(), DirectoryError> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DirectoryError::Transient("injected failure".into()));
        }
        self.items.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StaticBatch<'a> {
    dir: &'a StaticDirectory,
    queries: Vec<Query>,
}

impl DirectoryClient for StaticDirectory {
    fn start_batch(&self, capacity: usize) -> Result<Box<dyn DirectoryBatch + '_>, DirectoryError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticBatch {
            dir: self,
            queries: Vec::with_capacity(capacity),
        }))
    }
}

impl DirectoryBatch for StaticBatch<'_> {
    fn add_sid2name(&mut self, sid: &Sid) -> Result<(), DirectoryError> {
        self.dir.enqueue()?;
        self.queries.push(Query::Sid2Name(sid.clone()));
        Ok(())
    }

    fn add_name2sid(&mut self, name: &str, domain: &str) -> Result<(), DirectoryError> {
        self.dir.enqueue()?;
        self.queries.push(Query::Name2Sid {
            name: name.to_string(),
            domain: domain.to_string(),
        });
        Ok(())
    }

    fn end(self: Box<Self>) -> Result<Vec<ItemResult>, DirectoryError> {
        Ok(self.queries.iter().map(|q| self.dir.resolve(q)).collect())
    }
}
