//! Per-family translation strategies
//!
//! One strategy per protocol family, selected once per session. The family
//! set is closed and known at compile time, so dispatch is a match over the
//! [`Family`] enum with each arm calling plain functions, not a table of
//! trait objects.
//!
//! Every strategy supplies the same four behaviors: build the family-specific
//! match expressions of a rule, parse payload expressions back into rule
//! state, decide rule equivalence, and render the family-specific parts of a
//! display line. Emission order is fixed: interface (metadata) checks, then
//! protocol and address (payload) checks, matching the engine's
//! short-circuit evaluation; the translator appends extension matches,
//! counters and the verdict after the family fragments.

mod arp;
mod ip;
mod ip6;
mod raw;

use crate::core::error::Result;
use crate::core::expr::{CmpOp, Expression, MetaKey};
use crate::core::rule::{Interface, RuleState, inv};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Protocol family of a session, fixed for its lifetime
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
    #[strum(serialize = "arp")]
    Arp,
    #[strum(serialize = "bridge")]
    Bridge,
    /// Family-agnostic strategy for rulesets with no family header fields
    #[strum(serialize = "raw")]
    Raw,
}

impl Family {
    /// Family-specific match expressions of a rule, in evaluation order
    pub fn build_matches(self, cs: &RuleState) -> Result<Vec<Expression>> {
        match self {
            Family::Ipv4 => ip::build(cs),
            Family::Ipv6 => ip6::build(cs),
            Family::Arp => arp::build(cs),
            Family::Bridge | Family::Raw => raw::build(cs),
        }
    }

    /// Consumes one payload fragment (payload, optional bitwise, compare)
    /// starting at `exprs[0]`, writing the decoded match into `cs`. Returns
    /// the number of expressions consumed, or `None` when the offset is not
    /// one this family interprets (the caller preserves it opaquely).
    pub fn parse_payload(
        self,
        exprs: &[Expression],
        cs: &mut RuleState,
    ) -> Result<Option<usize>> {
        match self {
            Family::Ipv4 => ip::parse_payload(exprs, cs),
            Family::Ipv6 => ip6::parse_payload(exprs, cs),
            Family::Arp => arp::parse_payload(exprs, cs),
            Family::Bridge | Family::Raw => Ok(None),
        }
    }

    /// Rule identity for idempotent add and delete-by-specification.
    /// Field-by-field match/target/inversion equality; counters excluded.
    pub fn equivalent(self, a: &RuleState, b: &RuleState) -> bool {
        match self {
            Family::Ipv4 | Family::Ipv6 | Family::Arp | Family::Bridge | Family::Raw => {
                a.same_match(b)
            }
        }
    }

    /// Renders one rule in list mode. Family-specific parts (protocol name,
    /// interface clauses, addresses) come from this strategy's column
    /// helpers; counters and option clauses are shared formatter behavior.
    pub fn format(
        self,
        cs: &RuleState,
        num: usize,
        flags: crate::core::format::FormatFlags,
    ) -> String {
        crate::core::format::list_rule(self, cs, num, flags)
    }

    /// Address column text for a possibly-absent network
    pub fn format_addr(self, net: Option<&IpNetwork>, numeric: bool) -> String {
        match net {
            Some(net) => net.to_string(),
            None if numeric => match self {
                Family::Ipv6 => "::/0".to_string(),
                _ => "0.0.0.0/0".to_string(),
            },
            None => "anywhere".to_string(),
        }
    }
}

/// Interface match as a metadata load plus comparison. Wildcards compare the
/// bare prefix bytes, exact names include the trailing NUL.
pub(crate) fn iface_exprs(key: MetaKey, iface: &Interface, invert: bool) -> [Expression; 2] {
    let op = if invert { CmpOp::Neq } else { CmpOp::Eq };
    [
        Expression::Meta { key },
        Expression::cmp(op, iface.cmp_bytes()),
    ]
}

/// Single-byte protocol comparison at the family's protocol offset
pub(crate) fn proto_exprs(offset: u32, proto: u8, invert: bool) -> [Expression; 2] {
    let op = if invert { CmpOp::Neq } else { CmpOp::Eq };
    [
        Expression::Payload { offset, len: 1 },
        Expression::cmp_u8(op, proto),
    ]
}

pub(crate) fn inv_op(cs: &RuleState, bit: u8) -> CmpOp {
    if cs.invflags & bit != 0 {
        CmpOp::Neq
    } else {
        CmpOp::Eq
    }
}

/// True when the protocol comparison is elided: family wildcard with no
/// inversion requested
pub(crate) fn proto_elided(cs: &RuleState) -> bool {
    cs.protocol == 0 && cs.invflags & inv::PROTO == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_family_names_roundtrip() {
        for name in ["ipv4", "ipv6", "arp", "bridge", "raw"] {
            let family = Family::from_str(name).unwrap();
            assert_eq!(family.to_string(), name);
        }
    }

    #[test]
    fn test_proto_elision() {
        let mut cs = RuleState::default();
        assert!(proto_elided(&cs));
        cs.invflags |= inv::PROTO;
        assert!(!proto_elided(&cs));
        cs.invflags = 0;
        cs.protocol = 6;
        assert!(!proto_elided(&cs));
    }

    #[test]
    fn test_wildcard_addr_rendering() {
        assert_eq!(Family::Ipv4.format_addr(None, true), "0.0.0.0/0");
        assert_eq!(Family::Ipv6.format_addr(None, true), "::/0");
        assert_eq!(Family::Ipv4.format_addr(None, false), "anywhere");
        let net: IpNetwork = "10.0.0.0/8".parse().unwrap();
        assert_eq!(Family::Ipv4.format_addr(Some(&net), true), "10.0.0.0/8");
    }
}
