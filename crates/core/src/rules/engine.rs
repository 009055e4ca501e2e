//! Evaluate name rules for one lookup.
//!
//! Candidates come back from the rule store in priority order and are tried
//! one by one:
//!
//! * an empty destination denies the mapping (`NoMapping`), terminal;
//! * a literal destination is looked up and returned, found or not;
//! * a `*` destination looks up the source name itself, and moves on to the
//!   next candidate if that name does not exist.
//!
//! Running out of candidates is `NotFound`, which tells the caller to fall
//! back to an ephemeral id.

use tracing::debug;

use crate::db::rules::RuleStore;
use crate::errors::MapError;
use crate::models::{Direction, IdKind, NameType};
use crate::nameservice::NameService;
use crate::sid::Sid;
use crate::wellknown;

use super::{is_empty_name, is_wildcard};

/// Windows-to-unix rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixMatch {
    pub kind: IdKind,
    pub id: u32,
    pub unixname: String,
    pub direction: Direction,
}

/// Unix-to-windows rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinMatch {
    pub sid: Sid,
    pub winname: String,
    pub windomain: String,
    pub name_type: NameType,
    pub direction: Direction,
}

/// Rule evaluation over one worker's rule store.
pub struct RuleEngine<'a> {
    rules: &'a RuleStore,
    names: &'a dyn NameService,
    mapping_domain: Option<&'a str>,
}

impl<'a> RuleEngine<'a> {
    pub fn new(
        rules: &'a RuleStore,
        names: &'a dyn NameService,
        mapping_domain: Option<&'a str>,
    ) -> Self {
        Self {
            rules,
            names,
            mapping_domain,
        }
    }

    /// Map `winname@windomain` to a Unix id of `kind`.
    pub fn map_win_to_unix(
        &self,
        winname: &str,
        windomain: Option<&str>,
        kind: IdKind,
    ) -> Result<UnixMatch, MapError> {
        let domain = windomain.unwrap_or_default();
        let default_domain = self
            .mapping_domain
            .is_some_and(|d| !d.is_empty() && d.eq_ignore_ascii_case(domain));
        let candidates = self
            .rules
            .w2u_candidates(kind.is_user(), winname, domain, default_domain)?;

        for candidate in candidates {
            if is_empty_name(&candidate.unixname) {
                debug!(winname, domain, "denied by name rule");
                return Err(MapError::NoMapping);
            }
            let self_ref = is_wildcard(&candidate.unixname);
            let unixname = if self_ref {
                winname
            } else {
                candidate.unixname.as_str()
            };

            match self.names.lookup_by_name(kind, unixname) {
                Ok(id) => {
                    let direction = if candidate.u2w_order.is_some_and(|o| o > 0) {
                        Direction::Bi
                    } else {
                        Direction::W2u
                    };
                    debug!(winname, domain, unixname, id, "name rule matched");
                    return Ok(UnixMatch {
                        kind,
                        id,
                        unixname: unixname.to_string(),
                        direction,
                    });
                }
                Err(MapError::NotFound) if self_ref => continue,
                Err(MapError::NotFound) => return Err(MapError::NoMapping),
                Err(e) => return Err(e),
            }
        }
        Err(MapError::NotFound)
    }

    /// Map the Unix name `unixname` to a SID.
    ///
    /// `resolve` turns a Windows `(name, domain)` into a SID; the caller
    /// decides which sources it consults.
    pub fn map_unix_to_win<F>(
        &self,
        unixname: &str,
        kind: IdKind,
        mut resolve: F,
    ) -> Result<WinMatch, MapError>
    where
        F: FnMut(&str, &str) -> Result<(Sid, NameType), MapError>,
    {
        let candidates = self.rules.u2w_candidates(kind.is_user(), unixname)?;

        for candidate in candidates {
            if is_empty_name(&candidate.winname) {
                debug!(unixname, "denied by name rule");
                return Err(MapError::NoMapping);
            }
            let self_ref = is_wildcard(&candidate.winname);
            let winname = if self_ref {
                unixname
            } else {
                candidate.winname.as_str()
            };

            let windomain = match candidate.windomain.as_deref().filter(|d| !d.is_empty()) {
                Some(d) => d.to_string(),
                None => match self.mapping_domain.filter(|d| !d.is_empty()) {
                    Some(d) => d.to_string(),
                    None if wellknown::lookup_by_name(winname).is_some() => String::new(),
                    None => return Err(MapError::DomainNotFound(winname.to_string())),
                },
            };

            let outcome = resolve(winname, &windomain).and_then(|(sid, name_type)| {
                match (kind, name_type) {
                    (IdKind::Uid, NameType::Group) => Err(MapError::NotUser),
                    (IdKind::Gid, NameType::User) => Err(MapError::NotGroup),
                    _ => Ok((sid, name_type)),
                }
            });

            match outcome {
                Ok((sid, name_type)) => {
                    let direction = if candidate.w2u_order.is_some_and(|o| o > 0) {
                        Direction::Bi
                    } else {
                        Direction::U2w
                    };
                    debug!(unixname, winname, %windomain, %sid, "name rule matched");
                    return Ok(WinMatch {
                        sid,
                        winname: winname.to_string(),
                        windomain,
                        name_type,
                        direction,
                    });
                }
                Err(MapError::NotFound | MapError::NotUser | MapError::NotGroup) if self_ref => {
                    continue
                }
                Err(MapError::NotFound) => return Err(MapError::NoMapping),
                Err(e) => return Err(e),
            }
        }
        Err(MapError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nameservice::StaticNameService;
    use crate::rules::NameRule;

    fn names() -> StaticNameService {
        StaticNameService::new()
            .with_user("bob", 1001)
            .with_user("alice", 1002)
            .with_group("staff", 50)
    }

    #[test]
    fn test_deny_beats_literal() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "foo", Some("CORP"), "", Direction::W2u), None)
            .unwrap();
        rules
            .add_rule(&NameRule::new(true, "foo", Some("CORP"), "bob", Direction::W2u), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, Some("CORP"));
        assert_eq!(
            engine.map_win_to_unix("foo", Some("CORP"), IdKind::Uid),
            Err(MapError::NoMapping)
        );
    }

    #[test]
    fn test_literal_destination() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "foo", Some("CORP"), "bob", Direction::Bi), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, None);
        let m = engine.map_win_to_unix("foo", Some("CORP"), IdKind::Uid).unwrap();
        assert_eq!(m.id, 1001);
        assert_eq!(m.direction, Direction::Bi);
    }

    #[test]
    fn test_missing_literal_is_no_mapping() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "foo", Some("CORP"), "ghost", Direction::W2u), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, None);
        assert_eq!(
            engine.map_win_to_unix("foo", Some("CORP"), IdKind::Uid),
            Err(MapError::NoMapping)
        );
    }

    #[test]
    fn test_wildcard_falls_through() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "*", Some("CORP"), "*", Direction::W2u), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, None);

        let m = engine.map_win_to_unix("alice", Some("CORP"), IdKind::Uid).unwrap();
        assert_eq!(m.id, 1002);
        assert_eq!(m.direction, Direction::W2u);

        assert_eq!(
            engine.map_win_to_unix("zed", Some("CORP"), IdKind::Uid),
            Err(MapError::NotFound)
        );
    }

    #[test]
    fn test_wildcard_then_default_rule() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "*", Some("CORP"), "*", Direction::W2u), None)
            .unwrap();
        rules
            .add_rule(&NameRule::new(true, "*", Some("CORP"), "bob", Direction::W2u), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, None);
        let m = engine.map_win_to_unix("zed", Some("CORP"), IdKind::Uid).unwrap();
        assert_eq!(m.unixname, "bob");
    }

    #[test]
    fn test_default_domain_substitution() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "foo", Some(""), "bob", Direction::W2u), None)
            .unwrap();
        let ns = names();

        let engine = RuleEngine::new(&rules, &ns, Some("corp"));
        assert_eq!(
            engine.map_win_to_unix("foo", Some("CORP"), IdKind::Uid).unwrap().id,
            1001
        );

        let engine = RuleEngine::new(&rules, &ns, Some("OTHER"));
        assert_eq!(
            engine.map_win_to_unix("foo", Some("CORP"), IdKind::Uid),
            Err(MapError::NotFound)
        );
    }

    #[test]
    fn test_unix_to_win() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "robert", Some("CORP"), "bob", Direction::U2w), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, None);

        let m = engine
            .map_unix_to_win("bob", IdKind::Uid, |name, domain| {
                assert_eq!((name, domain), ("robert", "CORP"));
                Ok((Sid::new("S-1-5-21-1-2-3", 1500), NameType::User))
            })
            .unwrap();
        assert_eq!(m.sid.rid, 1500);
        assert_eq!(m.direction, Direction::U2w);
    }

    #[test]
    fn test_unix_to_win_needs_domain() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "*", Some(""), "*", Direction::U2w), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, None);
        let result = engine.map_unix_to_win("bob", IdKind::Uid, |_, _| Err(MapError::NotFound));
        assert_eq!(result, Err(MapError::DomainNotFound("bob".into())));
    }

    #[test]
    fn test_unix_to_win_type_mismatch() {
        let rules = RuleStore::in_memory().unwrap();
        rules
            .add_rule(&NameRule::new(true, "admins", Some("CORP"), "bob", Direction::U2w), None)
            .unwrap();
        let ns = names();
        let engine = RuleEngine::new(&rules, &ns, None);
        let result = engine.map_unix_to_win("bob", IdKind::Uid, |_, _| {
            Ok((Sid::new("S-1-5-21-1-2-3", 512), NameType::Group))
        });
        assert_eq!(result, Err(MapError::NotUser));
    }
}
