//! Priority of a name rule within each direction.
//!
//! Lower order wins. Within one level of specificity an explicit deny
//! outranks a concrete destination, and a wildcard domain is the least
//! specific axis.
//!
//! Windows to Unix:
//!
//! | order | rule                          |
//! |-------|-------------------------------|
//! | 1     | `winname@domain` to `""`      |
//! | 2     | `winname@domain` to `unix`    |
//! | 3     | `winname@*` to `""`           |
//! | 4     | `winname@*` to `unix`         |
//! | 5     | `*@domain` to `*`             |
//! | 6     | `*@domain` to `""`            |
//! | 7     | `*@domain` to `unix`          |
//! | 8     | `*@*` to `*`                  |
//! | 9     | `*@*` to `""`                 |
//! | 10    | `*@*` to `unix`               |
//!
//! Unix to Windows:
//!
//! | order | rule                          |
//! |-------|-------------------------------|
//! | 1     | `unix` to `""`                |
//! | 2     | `unix` to `winname@domain`    |
//! | 3     | `*` to `*@domain`             |
//! | 4     | `*` to `""`                   |
//! | 5     | `*` to `winname@domain`       |

use crate::errors::MapError;
use crate::models::Direction;

use super::{is_empty_name, is_wildcard};

/// Orders a rule is stored with. `None` means the rule does not apply in
/// that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOrder {
    pub w2u: Option<u8>,
    pub u2w: Option<u8>,
}

/// Compute the w2u and u2w orders of a rule, rejecting combinations that
/// can never be evaluated.
pub fn rule_priority(
    winname: &str,
    windomain: Option<&str>,
    unixname: &str,
    direction: Direction,
) -> Result<RuleOrder, MapError> {
    let w2u = match direction {
        Direction::Bi | Direction::W2u => Some(w2u_order(winname, windomain, unixname)?),
        Direction::U2w => None,
    };
    let u2w = match direction {
        Direction::Bi | Direction::U2w => Some(u2w_order(winname, windomain, unixname)?),
        Direction::W2u => None,
    };
    Ok(RuleOrder { w2u, u2w })
}

fn w2u_order(winname: &str, windomain: Option<&str>, unixname: &str) -> Result<u8, MapError> {
    if is_empty_name(winname) {
        return Err(MapError::W2uNameRule("Windows name must not be empty".into()));
    }
    let any_domain = windomain.is_some_and(is_wildcard);
    let deny = is_empty_name(unixname);
    let same_name = is_wildcard(unixname);

    let order = match (is_wildcard(winname), any_domain) {
        (true, true) if same_name => 8,
        (true, true) if deny => 9,
        (true, true) => 10,
        (true, false) if same_name => 5,
        (true, false) if deny => 6,
        (true, false) => 7,
        (false, _) if same_name => {
            return Err(MapError::W2uNameRule(format!(
                "'{winname}' cannot map to the wildcard Unix name"
            )))
        }
        (false, true) if deny => 3,
        (false, true) => 4,
        (false, false) if deny => 1,
        (false, false) => 2,
    };
    Ok(order)
}

fn u2w_order(winname: &str, windomain: Option<&str>, unixname: &str) -> Result<u8, MapError> {
    if is_empty_name(unixname) {
        return Err(MapError::U2wNameRule("Unix name must not be empty".into()));
    }
    if windomain.is_some_and(is_wildcard) {
        return Err(MapError::U2wNameRule(
            "a Windows domain wildcard cannot be a destination".into(),
        ));
    }
    let deny = is_empty_name(winname);

    let order = if is_wildcard(unixname) {
        if is_wildcard(winname) {
            3
        } else if deny {
            4
        } else {
            5
        }
    } else if is_wildcard(winname) {
        return Err(MapError::U2wNameRule(format!(
            "'{unixname}' cannot map to the wildcard Windows name"
        )));
    } else if deny {
        1
    } else {
        2
    };
    Ok(order)
}
