//! Security identifiers split into a domain prefix and a relative id.
//!
//! Every store and lookup in the engine keys on `(prefix, rid)`: the prefix
//! is everything up to the last sub-authority (`S-1-5-21-1-2-3`), the rid is
//! the last sub-authority (`1104`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::MapError;

/// A SID as `(prefix, rid)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid {
    pub prefix: String,
    pub rid: u32,
}

impl Sid {
    pub fn new(prefix: impl Into<String>, rid: u32) -> Self {
        Self {
            prefix: prefix.into(),
            rid,
        }
    }

    /// Parse the textual `S-1-<authority>-<sub>...-<rid>` form.
    pub fn parse(s: &str) -> Result<Self, MapError> {
        let bad = || MapError::SidFormat(s.to_string());
        let rest = s
            .strip_prefix("S-")
            .or_else(|| s.strip_prefix("s-"))
            .ok_or_else(bad)?;

        let parts: Vec<&str> = rest.split('-').collect();
        // revision, authority, and at least one sub-authority
        if parts.len() < 3 {
            return Err(bad());
        }
        if parts[0] != "1" {
            return Err(bad());
        }
        parts[1].parse::<u64>().map_err(|_| bad())?;
        for sub in &parts[2..] {
            sub.parse::<u32>().map_err(|_| bad())?;
        }

        let (prefix, rid) = s.rsplit_once('-').ok_or_else(bad)?;
        let rid = rid.parse::<u32>().map_err(|_| bad())?;
        Ok(Self {
            prefix: format!("S{}", &prefix[1..]),
            rid,
        })
    }

    /// Case-insensitive prefix comparison, used for the machine SID check.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.prefix.eq_ignore_ascii_case(prefix)
    }

    /// Encode as the binary `objectSid` layout used by directory servers.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MapError> {
        let bad = || MapError::SidFormat(self.to_string());
        let parts: Vec<&str> = self.prefix.split('-').collect();
        if parts.len() < 3 {
            return Err(bad());
        }
        let revision: u8 = parts[1].parse().map_err(|_| bad())?;
        let authority: u64 = parts[2].parse().map_err(|_| bad())?;
        if authority >= 1 << 48 {
            return Err(bad());
        }
        let mut subs = parts[3..]
            .iter()
            .map(|p| p.parse::<u32>().map_err(|_| bad()))
            .collect::<Result<Vec<_>, _>>()?;
        subs.push(self.rid);
        if subs.len() > 15 {
            return Err(bad());
        }

        let mut out = Vec::with_capacity(8 + subs.len() * 4);
        out.push(revision);
        out.push(subs.len() as u8);
        out.extend_from_slice(&authority.to_be_bytes()[2..]);
        for sub in subs {
            out.extend_from_slice(&sub.to_le_bytes());
        }
        Ok(out)
    }

    /// Decode the binary `objectSid` layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MapError> {
        let bad = || MapError::SidFormat(format!("{} byte binary SID", bytes.len()));
        if bytes.len() < 8 {
            return Err(bad());
        }
        let revision = bytes[0];
        let count = bytes[1] as usize;
        if count == 0 || bytes.len() != 8 + count * 4 {
            return Err(bad());
        }
        let mut auth = [0u8; 8];
        auth[2..].copy_from_slice(&bytes[2..8]);
        let authority = u64::from_be_bytes(auth);

        let subs: Vec<u32> = bytes[8..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let (rid, head) = subs.split_last().ok_or_else(bad)?;

        let mut prefix = format!("S-{revision}-{authority}");
        for sub in head {
            prefix.push('-');
            prefix.push_str(&sub.to_string());
        }
        Ok(Self { prefix, rid: *rid })
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.rid)
    }
}

impl FromStr for Sid {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sid::parse(s)
    }
}
