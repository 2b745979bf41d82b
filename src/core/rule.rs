//! Legacy rule state and ruleset entities
//!
//! [`RuleState`] is what CLI-level callers and the translator exchange: a
//! conjunction of protocol/address/interface matches plus a terminal action
//! and counters, in legacy terms. [`Table`], [`Chain`] and [`Rule`] are the
//! client-side view of the kernel-held entities the repository operations
//! work on.
//!
//! Interface matches keep the kernel's byte-for-byte wildcard mask next to
//! the printable name: `eth+` and `eth0` are different matches even though
//! one is a prefix of the other, and two rules compare equal only when name
//! and mask both agree.

use crate::core::expr::{Expression, Verdict};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kernel interface name limit, including the trailing NUL
pub const IFNAMSIZ: usize = 16;

/// Inversion flag bits of [`RuleState::invflags`]
pub mod inv {
    pub const PROTO: u8 = 0x01;
    pub const SRC: u8 = 0x02;
    pub const DST: u8 = 0x04;
    pub const VIA_IN: u8 = 0x08;
    pub const VIA_OUT: u8 = 0x10;
}

/// Packet/byte counter pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

impl Counters {
    pub fn new(packets: u64, bytes: u64) -> Self {
        Self { packets, bytes }
    }
}

/// Interface match: printable name plus wildcard mask
///
/// The mask has one byte per name byte; 0xff marks a byte that must match.
/// An exact match covers the name and its trailing NUL, a wildcard match
/// (written `eth+` in legacy syntax) covers only the prefix bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub mask: Vec<u8>,
}

impl Interface {
    /// Exact-name match (`eth0`)
    pub fn exact(name: &str) -> Self {
        let mut mask = vec![0u8; IFNAMSIZ];
        for b in mask.iter_mut().take(name.len() + 1) {
            *b = 0xff;
        }
        Self {
            name: name.to_string(),
            mask,
        }
    }

    /// Prefix match (`eth+` stores the prefix `eth`)
    pub fn wildcard(prefix: &str) -> Self {
        let mut mask = vec![0u8; IFNAMSIZ];
        for b in mask.iter_mut().take(prefix.len()) {
            *b = 0xff;
        }
        Self {
            name: prefix.to_string(),
            mask,
        }
    }

    /// Parses legacy syntax: a trailing `+` makes the match a prefix match
    pub fn parse(spec: &str) -> Self {
        if let Some(prefix) = spec.strip_suffix('+') {
            Self::wildcard(prefix)
        } else {
            Self::exact(spec)
        }
    }

    pub fn is_wildcard(&self) -> bool {
        // An exact match always masks the trailing NUL as well
        self.mask.get(self.name.len()) != Some(&0xff)
    }

    /// Bytes the comparison covers on the wire: name+NUL for exact matches,
    /// the bare prefix for wildcards
    pub fn cmp_bytes(&self) -> Vec<u8> {
        let mut data = self.name.as_bytes().to_vec();
        if !self.is_wildcard() {
            data.push(0);
        }
        data
    }

    /// Reconstructs the interface from comparison bytes
    pub fn from_cmp_bytes(data: &[u8]) -> Self {
        match data.last() {
            Some(0) => Self::exact(&String::from_utf8_lossy(&data[..data.len() - 1])),
            _ => Self::wildcard(&String::from_utf8_lossy(data)),
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            write!(f, "{}+", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Well-known transport protocol numbers for the legacy `-p` option
const PROTO_NAMES: &[(u16, &str)] = &[
    (1, "icmp"),
    (6, "tcp"),
    (17, "udp"),
    (50, "esp"),
    (51, "ah"),
    (58, "icmpv6"),
    (132, "sctp"),
];

/// Protocol number to legacy name; `None` for numbers without a well-known name
pub fn proto_to_name(proto: u16) -> Option<&'static str> {
    PROTO_NAMES
        .iter()
        .find(|(num, _)| *num == proto)
        .map(|(_, name)| *name)
}

/// Legacy protocol spec to number: a well-known name, `all` (wildcard), or a number
pub fn proto_from_name(spec: &str) -> Option<u16> {
    if spec == "all" {
        return Some(0);
    }
    PROTO_NAMES
        .iter()
        .find(|(_, name)| *name == spec)
        .map(|(num, _)| *num)
        .or_else(|| spec.parse().ok())
}

/// Terminal action of a legacy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Built-in verdict (`ACCEPT`, `DROP`, `RETURN`)
    Standard(Verdict),
    /// Jump to a user chain, returning when it falls off the end
    Jump(String),
    /// Transfer to a user chain without return
    Goto(String),
    /// Target extension state, carried opaquely
    Extension { name: String, args: Vec<String> },
}

impl Target {
    /// Resolves a legacy `-j` operand. A name that is not a built-in verdict
    /// is treated as a jump target when it carries no options; the jump is
    /// resolved against the table's chains at commit time.
    pub fn from_name(name: &str, args: Vec<String>) -> Self {
        if args.is_empty() {
            if let Ok(verdict) = Verdict::from_str(name) {
                return Target::Standard(verdict);
            }
            return Target::Jump(name.to_string());
        }
        Target::Extension {
            name: name.to_string(),
            args,
        }
    }

    /// Name shown in the target column of list output
    pub fn display_name(&self) -> String {
        match self {
            Target::Standard(v) => v.to_string(),
            Target::Jump(chain) | Target::Goto(chain) => chain.clone(),
            Target::Extension { name, .. } => name.clone(),
        }
    }
}

/// Generic match-extension state populated by option plugins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExt {
    pub name: String,
    pub args: Vec<String>,
}

/// Legacy-side rule state
///
/// `protocol == 0` is the family wildcard. Addresses are CIDR networks;
/// `opaque` holds classifier expressions the parse path did not interpret,
/// preserved so re-serialization is non-lossy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleState {
    pub protocol: u16,
    pub invflags: u8,
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
    pub iface_in: Option<Interface>,
    pub iface_out: Option<Interface>,
    pub matches: Vec<MatchExt>,
    pub target: Option<Target>,
    pub counters: Counters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opaque: Vec<Expression>,
}

impl RuleState {
    /// Field-by-field match equality; counters are excluded. Interface
    /// comparison covers the wildcard mask bytes, not just the name.
    pub fn same_match(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.invflags == other.invflags
            && self.src == other.src
            && self.dst == other.dst
            && self.iface_in == other.iface_in
            && self.iface_out == other.iface_out
            && self.matches == other.matches
            && self.target == other.target
            && self.opaque == other.opaque
    }

    /// Display name for the protocol column (`all` for the wildcard)
    pub fn protocol_name(&self) -> String {
        if self.protocol == 0 {
            "all".to_string()
        } else {
            proto_to_name(self.protocol)
                .map_or_else(|| self.protocol.to_string(), str::to_string)
        }
    }
}

/// Kernel hook attachment points for base chains
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum HookPoint {
    #[strum(serialize = "prerouting")]
    Prerouting,
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "forward")]
    Forward,
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "postrouting")]
    Postrouting,
}

/// Hook point plus evaluation priority of a base chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub hook: HookPoint,
    pub priority: i32,
}

/// Top-level container of chains, scoped to one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    /// Rules loaded but not evaluated by the kernel
    #[serde(default)]
    pub dormant: bool,
}

/// Ordered list of rules; base chains carry a hook and policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    pub table: String,
    pub hook: Option<Hook>,
    pub policy: Option<Verdict>,
    pub counters: Counters,
}

impl Chain {
    pub fn is_base(&self) -> bool {
        self.hook.is_some()
    }
}

/// One kernel-held rule: the handle is the only stable identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub handle: u64,
    pub expressions: Vec<Expression>,
}

/// Hook and priority of the well-known base chains per legacy table.
/// The save-script format records policies but not hooks, so restore
/// recovers the attachment from the (table, chain) pair.
pub fn builtin_hook(table: &str, chain: &str) -> Option<Hook> {
    let hook = |hook, priority| Some(Hook { hook, priority });
    match (table, chain) {
        ("filter", "INPUT") => hook(HookPoint::Input, 0),
        ("filter", "FORWARD") => hook(HookPoint::Forward, 0),
        ("filter", "OUTPUT") => hook(HookPoint::Output, 0),
        ("nat", "PREROUTING") => hook(HookPoint::Prerouting, -100),
        ("nat", "INPUT") => hook(HookPoint::Input, 100),
        ("nat", "OUTPUT") => hook(HookPoint::Output, -100),
        ("nat", "POSTROUTING") => hook(HookPoint::Postrouting, 100),
        ("mangle", "PREROUTING") => hook(HookPoint::Prerouting, -150),
        ("mangle", "INPUT") => hook(HookPoint::Input, -150),
        ("mangle", "FORWARD") => hook(HookPoint::Forward, -150),
        ("mangle", "OUTPUT") => hook(HookPoint::Output, -150),
        ("mangle", "POSTROUTING") => hook(HookPoint::Postrouting, -150),
        ("raw", "PREROUTING") => hook(HookPoint::Prerouting, -300),
        ("raw", "OUTPUT") => hook(HookPoint::Output, -300),
        _ => None,
    }
}
