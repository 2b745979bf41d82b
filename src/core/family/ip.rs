//! IPv4 strategy
//!
//! Header offsets are fixed by the IPv4 wire format: protocol at byte 9,
//! source address at 12, destination at 16. Prefixed networks emit a bitwise
//! mask between the payload load and the comparison.

use super::{iface_exprs, inv_op, proto_elided, proto_exprs};
use crate::core::error::{Error, Result};
use crate::core::expr::{CmpOp, Expression, MetaKey};
use crate::core::rule::{RuleState, inv};
use ipnetwork::{IpNetwork, Ipv4Network};
use std::net::Ipv4Addr;

const PROTO: u32 = 9;
const SADDR: u32 = 12;
const DADDR: u32 = 16;

pub(super) fn build(cs: &RuleState) -> Result<Vec<Expression>> {
    let mut exprs = Vec::new();
    if let Some(iface) = &cs.iface_in {
        exprs.extend(iface_exprs(
            MetaKey::IifName,
            iface,
            cs.invflags & inv::VIA_IN != 0,
        ));
    }
    if let Some(iface) = &cs.iface_out {
        exprs.extend(iface_exprs(
            MetaKey::OifName,
            iface,
            cs.invflags & inv::VIA_OUT != 0,
        ));
    }
    if !proto_elided(cs) {
        let proto = u8::try_from(cs.protocol).map_err(|_| {
            Error::TranslationUnsupported(format!("protocol {} in an ipv4 rule", cs.protocol))
        })?;
        exprs.extend(proto_exprs(PROTO, proto, cs.invflags & inv::PROTO != 0));
    }
    if let Some(net) = &cs.src {
        exprs.extend(addr_exprs(SADDR, net, inv_op(cs, inv::SRC))?);
    }
    if let Some(net) = &cs.dst {
        exprs.extend(addr_exprs(DADDR, net, inv_op(cs, inv::DST))?);
    }
    Ok(exprs)
}

fn addr_exprs(offset: u32, net: &IpNetwork, op: CmpOp) -> Result<Vec<Expression>> {
    let IpNetwork::V4(net) = net else {
        return Err(Error::TranslationUnsupported(
            "IPv6 address in an ipv4 rule".to_string(),
        ));
    };
    let mut exprs = vec![Expression::Payload { offset, len: 4 }];
    if net.prefix() < 32 {
        exprs.push(Expression::Bitwise {
            mask: net.mask().octets().to_vec(),
            xor: vec![0; 4],
        });
    }
    exprs.push(Expression::cmp(op, net.network().octets().to_vec()));
    Ok(exprs)
}

pub(super) fn parse_payload(exprs: &[Expression], cs: &mut RuleState) -> Result<Option<usize>> {
    let Some(Expression::Payload { offset, len }) = exprs.first() else {
        return Ok(None);
    };
    match (*offset, *len) {
        (PROTO, 1) => {
            let Some(Expression::Cmp { op, data }) = exprs.get(1) else {
                return Ok(None);
            };
            let [proto] = data.as_slice() else {
                return Ok(None);
            };
            cs.protocol = u16::from(*proto);
            if *op == CmpOp::Neq {
                cs.invflags |= inv::PROTO;
            }
            Ok(Some(2))
        }
        (SADDR | DADDR, 4) => {
            let Some((consumed, net, op)) = parse_addr(exprs)? else {
                return Ok(None);
            };
            if *offset == SADDR {
                cs.src = Some(net);
                if op == CmpOp::Neq {
                    cs.invflags |= inv::SRC;
                }
            } else {
                cs.dst = Some(net);
                if op == CmpOp::Neq {
                    cs.invflags |= inv::DST;
                }
            }
            Ok(Some(consumed))
        }
        _ => Ok(None),
    }
}

fn parse_addr(exprs: &[Expression]) -> Result<Option<(usize, IpNetwork, CmpOp)>> {
    let (mask, cmp_at) = match exprs.get(1) {
        Some(Expression::Bitwise { mask, .. }) => (Some(mask), 2),
        _ => (None, 1),
    };
    let Some(Expression::Cmp { op, data }) = exprs.get(cmp_at) else {
        return Ok(None);
    };
    let Ok(octets) = <[u8; 4]>::try_from(data.as_slice()) else {
        return Ok(None);
    };
    let prefix = match mask {
        Some(mask) if mask.len() == 4 => mask.iter().map(|b| b.count_ones() as u8).sum(),
        Some(_) => return Ok(None),
        None => 32,
    };
    let net = Ipv4Network::new(Ipv4Addr::from(octets), prefix)
        .map_err(|_| Error::TranslationUnsupported(format!("address mask /{prefix}")))?;
    Ok(Some((cmp_at + 1, IpNetwork::V4(net), *op)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_order_meta_before_payload() {
        let cs = RuleState {
            protocol: 6,
            iface_in: Some(crate::core::rule::Interface::exact("eth0")),
            src: Some("10.0.0.0/8".parse().unwrap()),
            ..RuleState::default()
        };
        let exprs = build(&cs).unwrap();
        assert!(matches!(exprs[0], Expression::Meta { .. }));
        assert!(matches!(exprs[2], Expression::Payload { offset: PROTO, .. }));
        assert!(matches!(exprs[4], Expression::Payload { offset: SADDR, .. }));
        assert!(matches!(exprs[5], Expression::Bitwise { .. }));
    }

    #[test]
    fn test_host_address_has_no_bitwise() {
        let cs = RuleState {
            dst: Some("192.0.2.1/32".parse().unwrap()),
            ..RuleState::default()
        };
        let exprs = build(&cs).unwrap();
        assert_eq!(exprs.len(), 2);
        assert!(matches!(
            &exprs[1],
            Expression::Cmp { op: CmpOp::Eq, data } if data == &vec![192, 0, 2, 1]
        ));
    }

    #[test]
    fn test_wildcard_proto_elided() {
        let exprs = build(&RuleState::default()).unwrap();
        assert!(exprs.is_empty());
    }

    #[test]
    fn test_inverted_wildcard_proto_not_elided() {
        let cs = RuleState {
            invflags: inv::PROTO,
            ..RuleState::default()
        };
        let exprs = build(&cs).unwrap();
        assert!(matches!(
            &exprs[1],
            Expression::Cmp { op: CmpOp::Neq, .. }
        ));
    }

    #[test]
    fn test_rejects_ipv6_address() {
        let cs = RuleState {
            src: Some("2001:db8::/32".parse().unwrap()),
            ..RuleState::default()
        };
        assert!(matches!(
            build(&cs),
            Err(Error::TranslationUnsupported(_))
        ));
    }

    #[test]
    fn test_parse_masked_address() {
        let cs_in = RuleState {
            src: Some("10.1.0.0/16".parse().unwrap()),
            ..RuleState::default()
        };
        let exprs = build(&cs_in).unwrap();
        let mut cs_out = RuleState::default();
        let consumed = parse_payload(&exprs, &mut cs_out).unwrap().unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(cs_out.src, cs_in.src);
    }
}
