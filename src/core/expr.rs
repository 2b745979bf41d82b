//! Classifier expression model
//!
//! An [`Expression`] is one atomic operation in the kernel-facing rule
//! representation: a metadata read, a payload read, a bitwise mask, a
//! comparison against the loaded value, an immediate verdict, or a counter.
//! Expressions carry no legacy meaning by themselves; the family strategy's
//! build/parse pair assigns it.
//!
//! The `Match`/`Target` variants carry legacy extension state (name plus the
//! option tokens the extension parsed) through the classifier untouched, and
//! `Unknown` preserves expression kinds this crate does not interpret so
//! re-serialization stays lossless.

use serde::{Deserialize, Serialize};

/// Comparison operator of a [`Expression::Cmp`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Neq,
}

/// Metadata key loaded by a [`Expression::Meta`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKey {
    /// Input interface name
    IifName,
    /// Output interface name
    OifName,
}

/// Built-in terminal verdicts
///
/// Display/parse forms are the uppercase legacy names (`ACCEPT`, `DROP`,
/// `RETURN`) used by both output modes and the save-script grammar.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Verdict {
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "RETURN")]
    Return,
}

/// Action carried by an immediate expression: a built-in verdict or a
/// transfer of control to a named chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictSpec {
    Terminal(Verdict),
    Jump(String),
    Goto(String),
}

impl VerdictSpec {
    /// Chain name referenced by a jump/goto, if any
    pub fn chain(&self) -> Option<&str> {
        match self {
            VerdictSpec::Terminal(_) => None,
            VerdictSpec::Jump(chain) | VerdictSpec::Goto(chain) => Some(chain),
        }
    }
}

/// One atomic classifier operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    /// Load a metadata value for the next comparison
    Meta { key: MetaKey },
    /// Load `len` bytes at `offset` into the packet header
    Payload { offset: u32, len: u32 },
    /// Mask/xor the loaded value before comparison
    Bitwise { mask: Vec<u8>, xor: Vec<u8> },
    /// Compare the loaded value against `data`
    Cmp { op: CmpOp, data: Vec<u8> },
    /// Terminal verdict or jump/goto
    Immediate { verdict: VerdictSpec },
    /// Packet/byte counter, always present in translated rules
    Counter { packets: u64, bytes: u64 },
    /// Legacy match extension state, carried opaquely
    Match { name: String, args: Vec<String> },
    /// Legacy target extension state, carried opaquely
    Target { name: String, args: Vec<String> },
    /// Expression kind this crate does not interpret, preserved as-is
    Unknown { kind: String, data: Vec<u8> },
}

impl Expression {
    pub fn cmp(op: CmpOp, data: Vec<u8>) -> Self {
        Expression::Cmp { op, data }
    }

    pub fn cmp_u8(op: CmpOp, val: u8) -> Self {
        Expression::Cmp {
            op,
            data: vec![val],
        }
    }

    /// Comparison against a 16-bit value in network byte order
    pub fn cmp_u16(op: CmpOp, val: u16) -> Self {
        Expression::Cmp {
            op,
            data: val.to_be_bytes().to_vec(),
        }
    }
}
