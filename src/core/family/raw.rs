//! Family-agnostic strategy
//!
//! Used for the bridge and raw families, which carry no family-specific
//! header fields here: only interface metadata matches translate; protocol
//! and address matches have no encoding.

use super::iface_exprs;
use crate::core::error::{Error, Result};
use crate::core::expr::{Expression, MetaKey};
use crate::core::rule::{RuleState, inv};

pub(super) fn build(cs: &RuleState) -> Result<Vec<Expression>> {
    if cs.protocol != 0 || cs.invflags & inv::PROTO != 0 {
        return Err(Error::TranslationUnsupported(
            "protocol match in a family-agnostic rule".to_string(),
        ));
    }
    if cs.src.is_some() || cs.dst.is_some() {
        return Err(Error::TranslationUnsupported(
            "address match in a family-agnostic rule".to_string(),
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
    Ok(exprs)
}
