//! IPv6 strategy
//!
//! Next-header byte at offset 6, source address at 8, destination at 24,
//! both 16 bytes wide. Otherwise mirrors the IPv4 strategy.

use super::{iface_exprs, inv_op, proto_elided, proto_exprs};
use crate::core::error::{Error, Result};
use crate::core::expr::{CmpOp, Expression, MetaKey};
use crate::core::rule::{RuleState, inv};
use ipnetwork::{IpNetwork, Ipv6Network};
use std::net::Ipv6Addr;

const NEXTHDR: u32 = 6;
const SADDR: u32 = 8;
const DADDR: u32 = 24;

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
            Error::TranslationUnsupported(format!("protocol {} in an ipv6 rule", cs.protocol))
        })?;
        exprs.extend(proto_exprs(NEXTHDR, proto, cs.invflags & inv::PROTO != 0));
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
    let IpNetwork::V6(net) = net else {
        return Err(Error::TranslationUnsupported(
            "IPv4 address in an ipv6 rule".to_string(),
        ));
    };
    let mut exprs = vec![Expression::Payload { offset, len: 16 }];
    if net.prefix() < 128 {
        exprs.push(Expression::Bitwise {
            mask: net.mask().octets().to_vec(),
            xor: vec![0; 16],
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
        (NEXTHDR, 1) => {
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
        (SADDR | DADDR, 16) => {
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
    let Ok(octets) = <[u8; 16]>::try_from(data.as_slice()) else {
        return Ok(None);
    };
    let prefix = match mask {
        Some(mask) if mask.len() == 16 => mask.iter().map(|b| b.count_ones() as u8).sum(),
        Some(_) => return Ok(None),
        None => 128,
    };
    let net = Ipv6Network::new(Ipv6Addr::from(octets), prefix)
        .map_err(|_| Error::TranslationUnsupported(format!("address mask /{prefix}")))?;
    Ok(Some((cmp_at + 1, IpNetwork::V6(net), *op)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_network_roundtrip() {
        let cs_in = RuleState {
            protocol: 58,
            src: Some("2001:db8::/32".parse().unwrap()),
            ..RuleState::default()
        };
        let exprs = build(&cs_in).unwrap();
        // proto payload+cmp, then saddr payload+bitwise+cmp
        assert_eq!(exprs.len(), 5);

        let mut cs_out = RuleState::default();
        let consumed = parse_payload(&exprs, &mut cs_out).unwrap().unwrap();
        assert_eq!(consumed, 2);
        let consumed = parse_payload(&exprs[2..], &mut cs_out).unwrap().unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(cs_out.protocol, 58);
        assert_eq!(cs_out.src, cs_in.src);
    }

    #[test]
    fn test_rejects_ipv4_address() {
        let cs = RuleState {
            dst: Some("10.0.0.0/8".parse().unwrap()),
            ..RuleState::default()
        };
        assert!(matches!(build(&cs), Err(Error::TranslationUnsupported(_))));
    }

    #[test]
    fn test_host_address_no_bitwise() {
        let cs = RuleState {
            dst: Some("2001:db8::1/128".parse().unwrap()),
            ..RuleState::default()
        };
        let exprs = build(&cs).unwrap();
        assert_eq!(exprs.len(), 2);
        assert!(matches!(&exprs[0], Expression::Payload { offset: DADDR, len: 16 }));
    }
}
