//! Administrator-defined name rules.
//!
//! A rule pairs a Windows name (`winname@windomain`) with a Unix name and
//! applies in one or both directions. `*` is a wildcard; an empty Unix or
//! Windows name is an explicit deny. [`priority`] assigns each rule its
//! order, [`engine`] evaluates the ordered candidates for one lookup.

pub mod engine;
pub mod priority;

use serde::{Deserialize, Serialize};

use crate::models::Direction;

pub use engine::RuleEngine;
pub use priority::{rule_priority, RuleOrder};

pub const WILDCARD: &str = "*";

/// True for `""` and for the two-character literal `""` typed at a prompt.
pub fn is_empty_name(name: &str) -> bool {
    name.is_empty() || name == "\"\""
}

pub fn is_wildcard(name: &str) -> bool {
    name == WILDCARD
}

/// A rule as submitted by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRule {
    pub is_user: bool,
    /// `None` takes the configured mapping domain when the rule is stored.
    pub windomain: Option<String>,
    pub winname: String,
    pub unixname: String,
    #[serde(default)]
    pub is_nt4: bool,
    pub direction: Direction,
}

impl NameRule {
    pub fn new(
        is_user: bool,
        winname: impl Into<String>,
        windomain: Option<&str>,
        unixname: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            is_user,
            windomain: windomain.map(str::to_string),
            winname: winname.into(),
            unixname: unixname.into(),
            is_nt4: false,
            direction,
        }
    }
}

/// A rule as it sits in the rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRule {
    pub is_user: bool,
    pub windomain: Option<String>,
    pub winname: String,
    pub unixname: String,
    pub is_nt4: bool,
    pub w2u_order: Option<u8>,
    pub u2w_order: Option<u8>,
}

impl StoredRule {
    pub fn direction(&self) -> Option<Direction> {
        let w2u = self.w2u_order.is_some_and(|o| o > 0);
        let u2w = self.u2w_order.is_some_and(|o| o > 0);
        match (w2u, u2w) {
            (true, true) => Some(Direction::Bi),
            (true, false) => Some(Direction::W2u),
            (false, true) => Some(Direction::U2w),
            (false, false) => None,
        }
    }
}

/// Selects rules to remove. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub is_user: bool,
    pub windomain: Option<String>,
    pub winname: Option<String>,
    pub unixname: Option<String>,
    /// Only rules valid in exactly this direction.
    pub direction: Option<Direction>,
}

impl RuleFilter {
    /// A filter that names nothing removes nothing.
    pub fn is_empty(&self) -> bool {
        self.windomain.is_none()
            && self.winname.is_none()
            && self.unixname.is_none()
            && self.direction.is_none()
    }
}
