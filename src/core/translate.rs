//! Rule translator
//!
//! The bidirectional codec between legacy [`RuleState`] and the classifier's
//! ordered expression list. Family-specific fragments (interfaces, protocol,
//! addresses) are delegated to the session's [`Family`] strategy; the
//! translator owns the family-independent tail: extension matches, the
//! counter expression (always present), and the immediate verdict/jump/goto.
//!
//! Expression kinds the parse path does not interpret are preserved in
//! `RuleState::opaque` rather than dropped, so re-serializing a rule this
//! crate did not author loses nothing.

use crate::core::error::Result;
use crate::core::expr::{Expression, VerdictSpec};
use crate::core::family::Family;
use crate::core::rule::{Counters, Interface, MatchExt, RuleState, Target, inv};

/// Translates legacy rule state into the ordered expression list the engine
/// evaluates. Family match fragments come first, then extension matches,
/// preserved opaque expressions, the counter, and finally the verdict.
pub fn build(family: Family, cs: &RuleState) -> Result<Vec<Expression>> {
    let mut exprs = family.build_matches(cs)?;
    for m in &cs.matches {
        exprs.push(Expression::Match {
            name: m.name.clone(),
            args: m.args.clone(),
        });
    }
    exprs.extend(cs.opaque.iter().cloned());
    exprs.push(Expression::Counter {
        packets: cs.counters.packets,
        bytes: cs.counters.bytes,
    });
    match &cs.target {
        Some(Target::Standard(v)) => exprs.push(Expression::Immediate {
            verdict: VerdictSpec::Terminal(*v),
        }),
        Some(Target::Jump(chain)) => exprs.push(Expression::Immediate {
            verdict: VerdictSpec::Jump(chain.clone()),
        }),
        Some(Target::Goto(chain)) => exprs.push(Expression::Immediate {
            verdict: VerdictSpec::Goto(chain.clone()),
        }),
        Some(Target::Extension { name, args }) => exprs.push(Expression::Target {
            name: name.clone(),
            args: args.clone(),
        }),
        None => {}
    }
    Ok(exprs)
}

/// Inverse of [`build`]: reconstructs legacy rule state from an expression
/// list, delegating payload fragments to the family strategy.
pub fn parse(family: Family, exprs: &[Expression]) -> Result<RuleState> {
    let mut cs = RuleState::default();
    let mut i = 0;
    while i < exprs.len() {
        match &exprs[i] {
            Expression::Meta { key } => {
                if let Some(Expression::Cmp { op, data }) = exprs.get(i + 1) {
                    let iface = Interface::from_cmp_bytes(data);
                    let inverted = *op == crate::core::expr::CmpOp::Neq;
                    match key {
                        crate::core::expr::MetaKey::IifName => {
                            cs.iface_in = Some(iface);
                            if inverted {
                                cs.invflags |= inv::VIA_IN;
                            }
                        }
                        crate::core::expr::MetaKey::OifName => {
                            cs.iface_out = Some(iface);
                            if inverted {
                                cs.invflags |= inv::VIA_OUT;
                            }
                        }
                    }
                    i += 2;
                } else {
                    cs.opaque.push(exprs[i].clone());
                    i += 1;
                }
            }
            Expression::Payload { .. } => match family.parse_payload(&exprs[i..], &mut cs)? {
                Some(consumed) => i += consumed,
                None => {
                    // Keep the whole payload fragment together
                    cs.opaque.push(exprs[i].clone());
                    i += 1;
                    while matches!(
                        exprs.get(i),
                        Some(Expression::Bitwise { .. } | Expression::Cmp { .. })
                    ) {
                        cs.opaque.push(exprs[i].clone());
                        i += 1;
                    }
                }
            },
            Expression::Counter { packets, bytes } => {
                cs.counters = Counters::new(*packets, *bytes);
                i += 1;
            }
            Expression::Immediate { verdict } => {
                cs.target = Some(match verdict {
                    VerdictSpec::Terminal(v) => Target::Standard(*v),
                    VerdictSpec::Jump(chain) => Target::Jump(chain.clone()),
                    VerdictSpec::Goto(chain) => Target::Goto(chain.clone()),
                });
                i += 1;
            }
            Expression::Match { name, args } => {
                cs.matches.push(MatchExt {
                    name: name.clone(),
                    args: args.clone(),
                });
                i += 1;
            }
            Expression::Target { name, args } => {
                cs.target = Some(Target::Extension {
                    name: name.clone(),
                    args: args.clone(),
                });
                i += 1;
            }
            Expression::Bitwise { .. } | Expression::Cmp { .. } | Expression::Unknown { .. } => {
                cs.opaque.push(exprs[i].clone());
                i += 1;
            }
        }
    }
    Ok(cs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::Verdict;

    fn ssh_rule() -> RuleState {
        RuleState {
            protocol: 6,
            matches: vec![MatchExt {
                name: "tcp".to_string(),
                args: vec!["--dport".to_string(), "22".to_string()],
            }],
            target: Some(Target::Standard(Verdict::Accept)),
            ..RuleState::default()
        }
    }

    #[test]
    fn test_counter_always_present() {
        let exprs = build(Family::Ipv4, &RuleState::default()).unwrap();
        assert!(
            exprs
                .iter()
                .any(|e| matches!(e, Expression::Counter { packets: 0, bytes: 0 }))
        );
    }

    #[test]
    fn test_verdict_is_last() {
        let exprs = build(Family::Ipv4, &ssh_rule()).unwrap();
        assert!(matches!(
            exprs.last(),
            Some(Expression::Immediate {
                verdict: VerdictSpec::Terminal(Verdict::Accept)
            })
        ));
    }

    #[test]
    fn test_roundtrip_full_rule() {
        let cs_in = RuleState {
            protocol: 17,
            invflags: inv::SRC,
            src: Some("10.0.0.0/8".parse().unwrap()),
            iface_in: Some(Interface::parse("eth+")),
            target: Some(Target::Jump("dns".to_string())),
            counters: Counters::new(12, 3456),
            ..RuleState::default()
        };
        let exprs = build(Family::Ipv4, &cs_in).unwrap();
        let cs_out = parse(Family::Ipv4, &exprs).unwrap();
        assert!(Family::Ipv4.equivalent(&cs_in, &cs_out));
        // Counters survive translation even though equivalence ignores them
        assert_eq!(cs_out.counters, cs_in.counters);
    }

    #[test]
    fn test_unknown_expressions_preserved() {
        let mut exprs = build(Family::Ipv4, &ssh_rule()).unwrap();
        exprs.insert(
            0,
            Expression::Unknown {
                kind: "quota".to_string(),
                data: vec![1, 2, 3],
            },
        );
        let cs = parse(Family::Ipv4, &exprs).unwrap();
        assert_eq!(cs.opaque.len(), 1);

        // Re-serialization keeps the unknown fragment
        let rebuilt = build(Family::Ipv4, &cs).unwrap();
        assert!(rebuilt.iter().any(|e| matches!(
            e,
            Expression::Unknown { kind, .. } if kind == "quota"
        )));
    }

    #[test]
    fn test_target_extension_roundtrip() {
        let cs_in = RuleState {
            target: Some(Target::Extension {
                name: "LOG".to_string(),
                args: vec!["--log-prefix".to_string(), "probe:".to_string()],
            }),
            ..RuleState::default()
        };
        let exprs = build(Family::Ipv4, &cs_in).unwrap();
        let cs_out = parse(Family::Ipv4, &exprs).unwrap();
        assert_eq!(cs_out.target, cs_in.target);
    }
}
