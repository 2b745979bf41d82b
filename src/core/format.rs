//! Output formatting for rules and chain headers
//!
//! Two canonical modes driven by the same parsed rule state: "list" (aligned
//! columns with counters) and "save" (re-ingestible script lines). Behavior
//! is controlled by [`FormatFlags`]; the save mode additionally prefixes
//! chains with `:name policy [packets:bytes]` lines.

use crate::core::family::Family;
use crate::core::rule::{Chain, RuleState, Target};
use std::fmt::Write;
use std::ops::BitOr;

/// Output flags, combined with `|`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatFlags(u32);

impl FormatFlags {
    /// Print addresses/ports as numbers, skip name resolution
    pub const NUMERIC: FormatFlags = FormatFlags(0x0001);
    /// Omit packet/byte counters
    pub const NOCOUNTS: FormatFlags = FormatFlags(0x0002);
    /// Scale large counter values with K/M/G suffixes
    pub const KILOMEGAGIGA: FormatFlags = FormatFlags(0x0004);
    /// Include per-match option clauses
    pub const OPTIONS: FormatFlags = FormatFlags(0x0008);
    /// Omit the table-name header line
    pub const NOTABLE: FormatFlags = FormatFlags(0x0010);
    /// Omit the target/verdict clause
    pub const NOTARGET: FormatFlags = FormatFlags(0x0020);
    /// Include "in"/"out" interface clauses
    pub const VIA: FormatFlags = FormatFlags(0x0040);
    /// Suppress the trailing newline (single-line embedding)
    pub const NONEWLINE: FormatFlags = FormatFlags(0x0080);
    /// Prefix each rule with its 1-based position
    pub const LINENUMBERS: FormatFlags = FormatFlags(0x0100);

    /// Single-rule print preset
    pub const PRINT_RULE: FormatFlags = FormatFlags(
        Self::NOCOUNTS.0 | Self::OPTIONS.0 | Self::VIA.0 | Self::NUMERIC.0 | Self::NOTABLE.0,
    );

    pub const fn empty() -> Self {
        FormatFlags(0)
    }

    pub const fn has(self, flag: FormatFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl BitOr for FormatFlags {
    type Output = FormatFlags;

    fn bitor(self, rhs: FormatFlags) -> FormatFlags {
        FormatFlags(self.0 | rhs.0)
    }
}

/// Counter value in a fixed-width column, scaled to K/M/G/T when
/// `KILOMEGAGIGA` is set and the value exceeds five digits
pub fn print_num(number: u64, flags: FormatFlags) -> String {
    if flags.has(FormatFlags::KILOMEGAGIGA) && number > 99999 {
        let mut n = (number + 500) / 1000;
        let mut suffix = 'K';
        for next in ['M', 'G', 'T'] {
            if n <= 9999 {
                break;
            }
            n = (n + 500) / 1000;
            suffix = next;
        }
        if flags.has(FormatFlags::NOTABLE) {
            format!("{n}{suffix} ")
        } else {
            format!("{n:>4}{suffix} ")
        }
    } else if flags.has(FormatFlags::NOTABLE) {
        format!("{number} ")
    } else {
        format!("{number:>8} ")
    }
}

/// List-mode chain header: policy and counters for base chains, the
/// reference count for user chains
pub fn list_chain_header(chain: &Chain, references: usize, flags: FormatFlags) -> String {
    let mut out = format!("Chain {}", chain.name);
    if let Some(policy) = chain.policy {
        let _ = write!(out, " (policy {policy}");
        if !flags.has(FormatFlags::NOCOUNTS) {
            let _ = write!(
                out,
                " {}packets, {}bytes",
                print_num(chain.counters.packets, flags | FormatFlags::NOTABLE),
                print_num(chain.counters.bytes, flags | FormatFlags::NOTABLE),
            );
        }
        out.push(')');
    } else {
        let _ = write!(out, " ({references} references)");
    }
    out
}

/// Column captions matching [`list_rule`]'s layout
pub fn list_captions(flags: FormatFlags) -> String {
    let mut out = String::new();
    if flags.has(FormatFlags::LINENUMBERS) {
        let _ = write!(out, "{:<4}", "num");
    }
    if !flags.has(FormatFlags::NOCOUNTS) {
        let _ = write!(out, "{:>8} {:>8} ", "pkts", "bytes");
    }
    if !flags.has(FormatFlags::NOTARGET) {
        let _ = write!(out, "{:<9} ", "target");
    }
    let _ = write!(out, "{:<5}", "prot");
    let _ = write!(out, "{:<4}", "opt");
    if flags.has(FormatFlags::VIA) {
        let _ = write!(out, "{:<7}{:<7}", "in", "out");
    }
    let _ = write!(out, "{:<21}{}", "source", "destination");
    out
}

fn iface_col(iface: Option<&crate::core::rule::Interface>, inverted: bool, flags: FormatFlags) -> String {
    let name = match iface {
        Some(iface) => iface.to_string(),
        None if flags.has(FormatFlags::NUMERIC) => "*".to_string(),
        None => "any".to_string(),
    };
    if inverted { format!("!{name}") } else { name }
}

/// One rule in list mode. `num` is the 1-based chain position shown when
/// `LINENUMBERS` is set.
pub fn list_rule(family: Family, cs: &RuleState, num: usize, flags: FormatFlags) -> String {
    use crate::core::rule::inv;

    let mut out = String::new();
    if flags.has(FormatFlags::LINENUMBERS) {
        let _ = write!(out, "{num:<4}");
    }
    if !flags.has(FormatFlags::NOCOUNTS) {
        let _ = write!(out, "{}", print_num(cs.counters.packets, flags));
        let _ = write!(out, "{}", print_num(cs.counters.bytes, flags));
    }
    if !flags.has(FormatFlags::NOTARGET) {
        let target = cs
            .target
            .as_ref()
            .map_or_else(String::new, Target::display_name);
        let _ = write!(out, "{target:<9} ");
    }

    let proto = if cs.invflags & inv::PROTO != 0 {
        format!("!{}", cs.protocol_name())
    } else {
        cs.protocol_name()
    };
    let _ = write!(out, "{proto:<5}");
    let _ = write!(out, "{:<4}", "--");

    if flags.has(FormatFlags::VIA) {
        let _ = write!(
            out,
            "{:<7}",
            iface_col(cs.iface_in.as_ref(), cs.invflags & inv::VIA_IN != 0, flags)
        );
        let _ = write!(
            out,
            "{:<7}",
            iface_col(cs.iface_out.as_ref(), cs.invflags & inv::VIA_OUT != 0, flags)
        );
    }

    let numeric = flags.has(FormatFlags::NUMERIC);
    let src = family.format_addr(cs.src.as_ref(), numeric);
    let src = if cs.invflags & inv::SRC != 0 {
        format!("!{src}")
    } else {
        src
    };
    let dst = family.format_addr(cs.dst.as_ref(), numeric);
    let dst = if cs.invflags & inv::DST != 0 {
        format!("!{dst}")
    } else {
        dst
    };
    let _ = write!(out, "{src:<21}{dst}");

    if flags.has(FormatFlags::OPTIONS) {
        for m in &cs.matches {
            let _ = write!(out, " {}", m.args.join(" "));
        }
        if let Some(Target::Extension { args, .. }) = &cs.target
            && !args.is_empty()
        {
            let _ = write!(out, " {}", args.join(" "));
        }
    }
    if !flags.has(FormatFlags::NONEWLINE) {
        out.push('\n');
    }
    out
}

/// Save-mode chain header: `:name policy [packets:bytes]`, `-` for user chains
pub fn save_chain_header(chain: &Chain, counters: bool) -> String {
    let policy = chain
        .policy
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    let (packets, bytes) = if counters {
        (chain.counters.packets, chain.counters.bytes)
    } else {
        (0, 0)
    };
    format!(":{} {policy} [{packets}:{bytes}]", chain.name)
}

/// One rule in save mode: a legacy-syntax line re-ingestible by restore
pub fn save_rule(cs: &RuleState, chain: &str, counters: bool) -> String {
    use crate::core::rule::inv;

    let mut out = String::new();
    if counters {
        let _ = write!(out, "[{}:{}] ", cs.counters.packets, cs.counters.bytes);
    }
    let _ = write!(out, "-A {chain}");
    if cs.protocol != 0 || cs.invflags & inv::PROTO != 0 {
        let bang = if cs.invflags & inv::PROTO != 0 { "! " } else { "" };
        let _ = write!(out, " {bang}-p {}", cs.protocol_name());
    }
    if let Some(src) = &cs.src {
        let bang = if cs.invflags & inv::SRC != 0 { "! " } else { "" };
        let _ = write!(out, " {bang}-s {src}");
    }
    if let Some(dst) = &cs.dst {
        let bang = if cs.invflags & inv::DST != 0 { "! " } else { "" };
        let _ = write!(out, " {bang}-d {dst}");
    }
    if let Some(iface) = &cs.iface_in {
        let bang = if cs.invflags & inv::VIA_IN != 0 { "! " } else { "" };
        let _ = write!(out, " {bang}-i {iface}");
    }
    if let Some(iface) = &cs.iface_out {
        let bang = if cs.invflags & inv::VIA_OUT != 0 { "! " } else { "" };
        let _ = write!(out, " {bang}-o {iface}");
    }
    for m in &cs.matches {
        // Options of the protocol's own extension read inline (`-p tcp
        // --dport 22`); other extensions keep their `-m name` introducer
        if m.name == cs.protocol_name() {
            let _ = write!(out, " {}", m.args.join(" "));
        } else {
            let _ = write!(out, " -m {}", m.name);
            if !m.args.is_empty() {
                let _ = write!(out, " {}", m.args.join(" "));
            }
        }
    }
    match &cs.target {
        Some(Target::Standard(v)) => {
            let _ = write!(out, " -j {v}");
        }
        Some(Target::Jump(chain)) => {
            let _ = write!(out, " -j {chain}");
        }
        Some(Target::Goto(chain)) => {
            let _ = write!(out, " -g {chain}");
        }
        Some(Target::Extension { name, args }) => {
            let _ = write!(out, " -j {name}");
            if !args.is_empty() {
                let _ = write!(out, " {}", args.join(" "));
            }
        }
        None => {}
    }
    out
}
