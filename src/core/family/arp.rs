//! ARP strategy
//!
//! Matches the sender and target protocol addresses of an Ethernet/IPv4 ARP
//! header (offsets 14 and 24 past the fixed 8-byte preamble plus the sender
//! hardware address). ARP has no transport protocol field, so any non-wildcard
//! protocol is unsupported.

use super::{iface_exprs, inv_op};
use crate::core::error::{Error, Result};
use crate::core::expr::{CmpOp, Expression, MetaKey};
use crate::core::rule::{RuleState, inv};
use ipnetwork::{IpNetwork, Ipv4Network};
use std::net::Ipv4Addr;

const SPA: u32 = 14;
const TPA: u32 = 24;

pub(super) fn build(cs: &RuleState) -> Result<Vec<Expression>> {
    if cs.protocol != 0 || cs.invflags & inv::PROTO != 0 {
        return Err(Error::TranslationUnsupported(
            "protocol match in an arp rule".to_string(),
        ));
    }
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
    if let Some(net) = &cs.src {
        exprs.extend(addr_exprs(SPA, net, inv_op(cs, inv::SRC))?);
    }
    if let Some(net) = &cs.dst {
        exprs.extend(addr_exprs(TPA, net, inv_op(cs, inv::DST))?);
    }
    Ok(exprs)
}

fn addr_exprs(offset: u32, net: &IpNetwork, op: CmpOp) -> Result<Vec<Expression>> {
    let IpNetwork::V4(net) = net else {
        return Err(Error::TranslationUnsupported(
            "IPv6 address in an arp rule".to_string(),
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
    if !matches!((*offset, *len), (SPA | TPA, 4)) {
        return Ok(None);
    }
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
    if *offset == SPA {
        cs.src = Some(IpNetwork::V4(net));
        if *op == CmpOp::Neq {
            cs.invflags |= inv::SRC;
        }
    } else {
        cs.dst = Some(IpNetwork::V4(net));
        if *op == CmpOp::Neq {
            cs.invflags |= inv::DST;
        }
    }
    Ok(Some(cmp_at + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_address_roundtrip() {
        let cs_in = RuleState {
            src: Some("192.168.0.0/24".parse().unwrap()),
            ..RuleState::default()
        };
        let exprs = build(&cs_in).unwrap();
        assert!(matches!(&exprs[0], Expression::Payload { offset: SPA, len: 4 }));

        let mut cs_out = RuleState::default();
        assert_eq!(parse_payload(&exprs, &mut cs_out).unwrap(), Some(3));
        assert_eq!(cs_out.src, cs_in.src);
    }

    #[test]
    fn test_protocol_match_unsupported() {
        let cs = RuleState {
            protocol: 6,
            ..RuleState::default()
        };
        assert!(matches!(build(&cs), Err(Error::TranslationUnsupported(_))));
    }
}
