//! Active Directory lookups over LDAP.
//!
//! The connection is opened lazily on the first batch and kept for later
//! ones. An I/O error or timeout drops it so the next attempt reconnects.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ldap3::{ldap_escape, LdapConn, LdapConnSettings, LdapError, Scope, SearchEntry};
use tracing::{debug, info, warn};

use crate::errors::DirectoryError;
use crate::models::NameType;
use crate::sid::Sid;

use super::{DirectoryBatch, DirectoryClient, DirectoryEntry, ItemResult, Query};

const ATTRS: [&str; 4] = ["sAMAccountName", "objectSid", "objectClass", "distinguishedName"];

/// LDAP server error codes worth retrying: busy, unavailable.
const RETRIABLE_CODES: [u32; 2] = [51, 52];

pub struct LdapDirectory {
    url: String,
    base_dn: String,
    bind_dn: Option<String>,
    bind_password: Option<String>,
    /// Domain reported for every entry. Derived from the DN when unset.
    domain_name: Option<String>,
    timeout: Duration,
    conn: Mutex<Option<LdapConn>>,
}

impl LdapDirectory {
    /// Does not connect; that happens on the first lookup.
    pub fn new(url: impl Into<String>, base_dn: impl Into<String>, timeout: Duration) -> Self {
        let dir = Self {
            url: url.into(),
            base_dn: base_dn.into(),
            bind_dn: None,
            bind_password: None,
            domain_name: None,
            timeout,
            conn: Mutex::new(None),
        };
        info!(url = %dir.url, base_dn = %dir.base_dn, "created LDAP directory client");
        dir
    }

    pub fn with_bind(mut self, bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind_dn = Some(bind_dn.into());
        self.bind_password = Some(password.into());
        self
    }

    pub fn with_domain_name(mut self, domain: impl Into<String>) -> Self {
        self.domain_name = Some(domain.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<LdapConn>> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("LDAP connection mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn connect(&self) -> Result<LdapConn, DirectoryError> {
        debug!(url = %self.url, "connecting to LDAP server");
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let mut conn = LdapConn::with_settings(settings, &self.url).map_err(classify)?;
        if let Some(bind_dn) = &self.bind_dn {
            let password = self.bind_password.as_deref().unwrap_or_default();
            conn.simple_bind(bind_dn, password)
                .and_then(|r| r.success())
                .map_err(classify)?;
            debug!(bind_dn, "LDAP bind succeeded");
        }
        Ok(conn)
    }

    /// Make sure a connection is open. Fails the enqueue, and with it the
    /// batch, when the server cannot be reached.
    fn ensure_connected(&self) -> Result<(), DirectoryError> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        Ok(())
    }

    fn search(&self, conn: &mut LdapConn, filter: &str) -> Result<Vec<SearchEntry>, LdapError> {
        let (entries, _) = conn
            .with_timeout(self.timeout)
            .search(&self.base_dn, Scope::Subtree, filter, ATTRS.to_vec())?
            .success()?;
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    /// Pick the answer for `query` out of the search results. A name lookup
    /// only accepts an account from the requested domain.
    fn select(&self, query: &Query, entries: &[SearchEntry]) -> ItemResult {
        let domain_name = self.domain_name.as_deref();
        match query {
            Query::Sid2Name(_) => match entries.first() {
                Some(entry) => parse_entry(entry, domain_name),
                None => Err(DirectoryError::NotFound),
            },
            Query::Name2Sid { name, domain } => {
                for entry in entries {
                    let parsed = parse_entry(entry, domain_name)?;
                    if domain_matches(&parsed.domain, domain) {
                        return Ok(parsed);
                    }
                    debug!(name, requested = %domain, found = %parsed.domain, "account in another domain");
                }
                Err(DirectoryError::NotFound)
            }
        }
    }

    fn run(&self, queries: &[Query]) -> Result<Vec<ItemResult>, DirectoryError> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(DirectoryError::Transient("no LDAP connection".into()));
        };

        let mut results = Vec::with_capacity(queries.len());
        let mut lost_connection = false;
        for query in queries {
            let filter = match query {
                Query::Sid2Name(sid) => match sid_filter(sid) {
                    Ok(f) => f,
                    Err(e) => {
                        results.push(Err(DirectoryError::Malformed(e.to_string())));
                        continue;
                    }
                },
                Query::Name2Sid { name, .. } => name_filter(name),
            };

            let outcome = match self.search(conn, &filter) {
                Ok(entries) => self.select(query, &entries),
                Err(e) => {
                    let err = classify(e);
                    if err.is_transient() || err == DirectoryError::Timeout {
                        lost_connection = true;
                    }
                    Err(err)
                }
            };
            results.push(outcome);
        }

        if lost_connection {
            warn!(url = %self.url, "dropping LDAP connection after failed search");
            *guard = None;
        }
        Ok(results)
    }
}

impl DirectoryClient for LdapDirectory {
    fn start_batch(&self, capacity: usize) -> Result<Box<dyn DirectoryBatch + '_>, DirectoryError> {
        Ok(Box::new(LdapBatch {
            dir: self,
            queries: Vec::with_capacity(capacity),
        }))
    }
}

struct LdapBatch<'a> {
    dir: &'a LdapDirectory,
    queries: Vec<Query>,
}

impl DirectoryBatch for LdapBatch<'_> {
    fn add_sid2name(&mut self, sid: &Sid) -> Result<(), DirectoryError> {
        self.dir.ensure_connected()?;
        self.queries.push(Query::Sid2Name(sid.clone()));
        Ok(())
    }

    fn add_name2sid(&mut self, name: &str, domain: &str) -> Result<(), DirectoryError> {
        self.dir.ensure_connected()?;
        self.queries.push(Query::Name2Sid {
            name: name.to_string(),
            domain: domain.to_string(),
        });
        Ok(())
    }

    fn end(self: Box<Self>) -> Result<Vec<ItemResult>, DirectoryError> {
        self.dir.run(&self.queries)
    }
}

fn classify(e: LdapError) -> DirectoryError {
    match e {
        LdapError::Io { .. } => DirectoryError::Transient(e.to_string()),
        LdapError::Timeout { .. } => DirectoryError::Timeout,
        LdapError::LdapResult { ref result } if RETRIABLE_CODES.contains(&result.rc) => {
            DirectoryError::Transient(e.to_string())
        }
        other => DirectoryError::Ldap(other.to_string()),
    }
}

/// `(objectSid=\01\05...)` with every byte escaped.
fn sid_filter(sid: &Sid) -> Result<String, crate::errors::MapError> {
    let bytes = sid.to_bytes()?;
    let escaped: String = bytes.iter().map(|b| format!("\\{b:02x}")).collect();
    Ok(format!("(objectSid={escaped})"))
}

fn name_filter(name: &str) -> String {
    format!(
        "(&(|(objectClass=user)(objectClass=group))(sAMAccountName={}))",
        ldap_escape(name)
    )
}

/// An empty request matches any domain. Otherwise the request must equal
/// the entry's domain or, for a dotted DNS domain, its first label.
fn domain_matches(found: &str, requested: &str) -> bool {
    if requested.is_empty() || found.eq_ignore_ascii_case(requested) {
        return true;
    }
    found
        .split_once('.')
        .is_some_and(|(label, _)| label.eq_ignore_ascii_case(requested))
}

/// `CN=x,OU=y,DC=corp,DC=example,DC=com` gives `corp.example.com`.
fn domain_from_dn(dn: &str) -> String {
    dn.split(',')
        .filter_map(|rdn| {
            let (key, value) = rdn.trim().split_once('=')?;
            key.trim().eq_ignore_ascii_case("dc").then(|| value.trim())
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn parse_entry(entry: &SearchEntry, domain_name: Option<&str>) -> ItemResult {
    let sid_bytes = entry
        .bin_attrs
        .get("objectSid")
        .and_then(|v| v.first().cloned())
        .or_else(|| {
            // A SID whose bytes happen to be valid UTF-8 lands in the text
            // attributes.
            entry
                .attrs
                .get("objectSid")
                .and_then(|v| v.first())
                .map(|s| s.as_bytes().to_vec())
        })
        .ok_or_else(|| DirectoryError::Malformed(format!("{}: no objectSid", entry.dn)))?;
    let sid = Sid::from_bytes(&sid_bytes).map_err(|e| DirectoryError::Malformed(e.to_string()))?;

    let name = entry
        .attrs
        .get("sAMAccountName")
        .and_then(|v| v.first())
        .cloned()
        .ok_or_else(|| DirectoryError::Malformed(format!("{}: no sAMAccountName", entry.dn)))?;

    let is_group = entry
        .attrs
        .get("objectClass")
        .is_some_and(|classes| classes.iter().any(|c| c.eq_ignore_ascii_case("group")));

    let domain = match domain_name {
        Some(d) => d.to_string(),
        None => domain_from_dn(&entry.dn),
    };

    Ok(DirectoryEntry {
        sid,
        name,
        domain,
        name_type: NameType::from_is_user(!is_group),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(classes: &[&str]) -> SearchEntry {
        let sid = Sid::new("S-1-5-21-7-8-9", 1104);
        let mut attrs = HashMap::new();
        attrs.insert("sAMAccountName".to_string(), vec!["alice".to_string()]);
        attrs.insert(
            "objectClass".to_string(),
            classes.iter().map(|c| c.to_string()).collect(),
        );
        let mut bin_attrs = HashMap::new();
        bin_attrs.insert("objectSid".to_string(), vec![sid.to_bytes().unwrap()]);
        SearchEntry {
            dn: "CN=Alice,OU=Staff,DC=corp,DC=example,DC=com".to_string(),
            attrs,
            bin_attrs,
        }
    }

    #[test]
    fn test_parse_user_entry() {
        let parsed = parse_entry(&entry(&["top", "person", "user"]), None).unwrap();
        assert_eq!(parsed.sid, Sid::new("S-1-5-21-7-8-9", 1104));
        assert_eq!(parsed.name, "alice");
        assert_eq!(parsed.domain, "corp.example.com");
        assert_eq!(parsed.name_type, NameType::User);
    }

    #[test]
    fn test_parse_group_entry_with_fixed_domain() {
        let parsed = parse_entry(&entry(&["top", "group"]), Some("CORP")).unwrap();
        assert_eq!(parsed.domain, "CORP");
        assert_eq!(parsed.name_type, NameType::Group);
    }

    #[test]
    fn test_entry_without_sid_is_malformed() {
        let mut e = entry(&["user"]);
        e.bin_attrs.clear();
        assert!(matches!(parse_entry(&e, None), Err(DirectoryError::Malformed(_))));
    }

    #[test]
    fn test_filters() {
        let sid = Sid::parse("S-1-5-32-544").unwrap();
        assert_eq!(
            sid_filter(&sid).unwrap(),
            "(objectSid=\\01\\02\\00\\00\\00\\00\\00\\05\\20\\00\\00\\00\\20\\02\\00\\00)"
        );
        assert!(name_filter("a*b").contains("sAMAccountName=a\\2ab"));
    }

    #[test]
    fn test_name_lookup_rejects_other_domain() {
        let dir = LdapDirectory::new("ldap://127.0.0.1:1", "dc=test", Duration::from_secs(2));
        let entries = [entry(&["user"])];
        let query = |domain: &str| Query::Name2Sid {
            name: "alice".into(),
            domain: domain.into(),
        };

        assert_eq!(dir.select(&query("OTHER"), &entries), Err(DirectoryError::NotFound));
        assert_eq!(dir.select(&query("corp.example.com"), &entries).unwrap().name, "alice");
        assert_eq!(dir.select(&query("CORP"), &entries).unwrap().name, "alice");
        assert!(dir.select(&query(""), &entries).is_ok());
        // SID lookups carry no domain.
        let by_sid = Query::Sid2Name(Sid::new("S-1-5-21-7-8-9", 1104));
        assert!(dir.select(&by_sid, &entries).is_ok());
        assert_eq!(dir.select(&by_sid, &[]), Err(DirectoryError::NotFound));
    }

    #[test]
    fn test_name_lookup_with_fixed_domain() {
        let dir = LdapDirectory::new("ldap://127.0.0.1:1", "dc=test", Duration::from_secs(2))
            .with_domain_name("EXAMPLE");
        let query = Query::Name2Sid {
            name: "alice".into(),
            domain: "corp".into(),
        };
        assert_eq!(dir.select(&query, &[entry(&["user"])]), Err(DirectoryError::NotFound));
    }

    #[test]
    fn test_domain_matches() {
        assert!(domain_matches("corp.example.com", "Corp"));
        assert!(domain_matches("CORP", "corp"));
        assert!(!domain_matches("corp.example.com", "example"));
        assert!(!domain_matches("CORP", "OTHER"));
    }

    #[test]
    fn test_domain_from_dn() {
        assert_eq!(domain_from_dn("CN=x, dc=Corp ,DC=local"), "Corp.local");
        assert_eq!(domain_from_dn("CN=x"), "");
    }

    #[test]
    fn test_unreachable_server_is_transient() {
        let dir = LdapDirectory::new("ldap://127.0.0.1:1", "dc=test", Duration::from_secs(2));
        let mut batch = dir.start_batch(1).unwrap();
        let err = batch.add_sid2name(&Sid::new("S-1-5-21-1-2-3", 500)).unwrap_err();
        assert!(err.is_transient());
    }
}
