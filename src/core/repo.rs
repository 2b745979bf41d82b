//! Repository operations: table, chain and rule lifecycle
//!
//! Each operation is a short-lived procedure over a [`Session`]: it opens or
//! reuses the session's batch, stages messages and interprets replies.
//! Mutations only reach the engine when the caller commits the session;
//! read-only operations (`find`, `dump`, `list`, `check`) issue a single
//! request/reply pair outside any batch and are always safely retryable.

use crate::core::channel::{ChainRules, MsgBody, Placement, Reply};
use crate::core::error::{Error, Result};
use crate::core::expr::Verdict;
use crate::core::format::{self, FormatFlags};
use crate::core::rule::{Chain, Counters, Hook, RuleState, Table, Target};
use crate::core::session::Session;
use crate::core::translate;
use crate::validators;
use std::fmt::Write;
use tracing::debug;

/// All tables known to the engine
pub fn table_list(h: &mut Session) -> Result<Vec<Table>> {
    match h.request(MsgBody::ListTables)? {
        Reply::Tables { tables, .. } => Ok(tables),
        other => Err(Error::ProtocolDesync(format!(
            "table list answered with {other:?}"
        ))),
    }
}

pub fn table_find(h: &mut Session, name: &str) -> Result<bool> {
    Ok(table_list(h)?.iter().any(|t| t.name == name))
}

pub fn table_add(h: &mut Session, name: &str) -> Result<()> {
    validators::validate_table_name(name).map_err(|message| Error::Validation {
        field: "table".to_string(),
        message,
    })?;
    h.stage(MsgBody::AddTable {
        table: name.to_string(),
    })?;
    Ok(())
}

pub fn table_set_dormant(h: &mut Session, name: &str) -> Result<()> {
    h.stage(MsgBody::SetDormant {
        table: name.to_string(),
        dormant: true,
    })?;
    Ok(())
}

pub fn table_wake(h: &mut Session, name: &str) -> Result<()> {
    h.stage(MsgBody::SetDormant {
        table: name.to_string(),
        dormant: false,
    })?;
    Ok(())
}

/// Deletes every chain of `chains` still present in the table. Chains
/// already absent are skipped, not an error; a chain still referenced by a
/// jump elsewhere surfaces as `ChainInUse` at commit.
pub fn table_purge_chains(h: &mut Session, table: &str, chains: &[String]) -> Result<()> {
    let present = chain_dump(h, Some(table))?;
    for chain in chains {
        if present.iter().any(|c| c.name == *chain) {
            h.stage(MsgBody::DelChain {
                table: table.to_string(),
                chain: chain.clone(),
            })?;
        }
    }
    Ok(())
}

/// Chains of one table, or of every table, in engine order
pub fn chain_dump(h: &mut Session, table: Option<&str>) -> Result<Vec<Chain>> {
    match h.request(MsgBody::ListChains {
        table: table.map(str::to_string),
    })? {
        Reply::Chains { chains, .. } => Ok(chains),
        other => Err(Error::ProtocolDesync(format!(
            "chain dump answered with {other:?}"
        ))),
    }
}

/// Creates (or re-declares) a base chain: hook, priority and policy are all
/// required for base chains.
pub fn chain_add(
    h: &mut Session,
    table: &str,
    chain: &str,
    hook: Hook,
    policy: Verdict,
    counters: Option<Counters>,
) -> Result<()> {
    validators::validate_chain_name(chain).map_err(|message| Error::Validation {
        field: "chain".to_string(),
        message,
    })?;
    h.stage(MsgBody::AddChain {
        table: table.to_string(),
        chain: chain.to_string(),
        hook: Some(hook),
        policy: Some(policy),
        counters,
    })?;
    Ok(())
}

/// Creates a user chain; user chains never carry a hook
pub fn chain_user_add(h: &mut Session, table: &str, chain: &str) -> Result<()> {
    validators::validate_chain_name(chain).map_err(|message| Error::Validation {
        field: "chain".to_string(),
        message,
    })?;
    if chain_dump(h, Some(table))?.iter().any(|c| c.name == chain) {
        return Err(Error::ChainExists(chain.to_string()));
    }
    h.stage(MsgBody::AddChain {
        table: table.to_string(),
        chain: chain.to_string(),
        hook: None,
        policy: None,
        counters: None,
    })?;
    Ok(())
}

pub fn chain_user_del(h: &mut Session, table: &str, chain: &str) -> Result<()> {
    h.stage(MsgBody::DelChain {
        table: table.to_string(),
        chain: chain.to_string(),
    })?;
    Ok(())
}

pub fn chain_user_rename(h: &mut Session, table: &str, chain: &str, newname: &str) -> Result<()> {
    validators::validate_chain_name(newname).map_err(|message| Error::Validation {
        field: "chain".to_string(),
        message,
    })?;
    let chains = chain_dump(h, Some(table))?;
    if !chains.iter().any(|c| c.name == chain) {
        return Err(Error::NoSuchChain(chain.to_string()));
    }
    if chains.iter().any(|c| c.name == newname) {
        return Err(Error::ChainExists(newname.to_string()));
    }
    h.stage(MsgBody::RenameChain {
        table: table.to_string(),
        chain: chain.to_string(),
        newname: newname.to_string(),
    })?;
    Ok(())
}

/// Updates policy (and optionally counters) of a base chain
pub fn chain_set(
    h: &mut Session,
    table: &str,
    chain: &str,
    policy: Verdict,
    counters: Option<Counters>,
) -> Result<()> {
    let chains = chain_dump(h, Some(table))?;
    let found = chains
        .iter()
        .find(|c| c.name == chain)
        .ok_or_else(|| Error::NoSuchChain(chain.to_string()))?;
    if !found.is_base() {
        return Err(Error::NotABaseChain(chain.to_string()));
    }
    h.stage(MsgBody::SetChain {
        table: table.to_string(),
        chain: chain.to_string(),
        policy,
        counters,
    })?;
    Ok(())
}

/// Save-mode chain headers for one table, builtin chains first
pub fn chain_save(h: &mut Session, table: &str, counters: bool) -> Result<String> {
    let chains = chain_dump(h, Some(table))?;
    let mut out = String::new();
    for chain in chains.iter().filter(|c| c.is_base()) {
        let _ = writeln!(out, "{}", format::save_chain_header(chain, counters));
    }
    for chain in chains.iter().filter(|c| !c.is_base()) {
        let _ = writeln!(out, "{}", format::save_chain_header(chain, counters));
    }
    Ok(out)
}

fn fetch_rules(h: &mut Session, table: &str, chain: Option<&str>) -> Result<Vec<ChainRules>> {
    match h.request(MsgBody::ListRules {
        table: table.to_string(),
        chain: chain.map(str::to_string),
    })? {
        Reply::Rules { rules, .. } => Ok(rules),
        other => Err(Error::ProtocolDesync(format!(
            "rule list answered with {other:?}"
        ))),
    }
}

/// Handle of the first rule in the chain equivalent to `cs`, if any
fn find_equivalent(
    h: &mut Session,
    table: &str,
    chain: &str,
    cs: &RuleState,
) -> Result<Option<u64>> {
    let family = h.family();
    let listed = fetch_rules(h, table, Some(chain))?;
    for rules in &listed {
        for rule in &rules.rules {
            let parsed = translate::parse(family, &rule.expressions)?;
            if family.equivalent(cs, &parsed) {
                return Ok(Some(rule.handle));
            }
        }
    }
    Ok(None)
}

/// Builds the rule's expressions and stages an insert
pub fn rule_add(
    h: &mut Session,
    table: &str,
    chain: &str,
    cs: &RuleState,
    placement: Placement,
) -> Result<()> {
    let expressions = translate::build(h.family(), cs)?;
    debug!(table, chain, expressions = expressions.len(), "staging rule add");
    h.stage(MsgBody::AddRule {
        table: table.to_string(),
        chain: chain.to_string(),
        placement,
        expressions,
    })?;
    Ok(())
}

/// True when the chain already holds a rule equivalent to `cs`.
/// Never mutates; the basis of idempotent "add if absent".
pub fn rule_check(h: &mut Session, table: &str, chain: &str, cs: &RuleState) -> Result<bool> {
    // Build first so an untranslatable rule state fails the same way it
    // would on add
    translate::build(h.family(), cs)?;
    Ok(find_equivalent(h, table, chain, cs)?.is_some())
}

/// Deletes the first rule equivalent to `cs`
pub fn rule_delete(h: &mut Session, table: &str, chain: &str, cs: &RuleState) -> Result<()> {
    translate::build(h.family(), cs)?;
    let handle = find_equivalent(h, table, chain, cs)?.ok_or_else(|| Error::NoMatchingRule {
        chain: chain.to_string(),
    })?;
    h.stage(MsgBody::DelRule {
        table: table.to_string(),
        chain: chain.to_string(),
        handle,
    })?;
    Ok(())
}

fn rule_at(h: &mut Session, table: &str, chain: &str, num: usize) -> Result<u64> {
    let listed = fetch_rules(h, table, Some(chain))?;
    let rules = listed
        .first()
        .map(|c| c.rules.as_slice())
        .unwrap_or_default();
    if num == 0 || num > rules.len() {
        return Err(Error::IndexOutOfRange {
            index: num,
            len: rules.len(),
        });
    }
    Ok(rules[num - 1].handle)
}

/// Deletes the rule at 1-based position `num`, regardless of content
pub fn rule_delete_num(h: &mut Session, table: &str, chain: &str, num: usize) -> Result<()> {
    let handle = rule_at(h, table, chain, num)?;
    h.stage(MsgBody::DelRule {
        table: table.to_string(),
        chain: chain.to_string(),
        handle,
    })?;
    Ok(())
}

/// Replaces the rule at 1-based position `num`: delete and insert at the
/// same position, staged into one batch so both happen or neither does
pub fn rule_replace(
    h: &mut Session,
    table: &str,
    chain: &str,
    num: usize,
    cs: &RuleState,
) -> Result<()> {
    let handle = rule_at(h, table, chain, num)?;
    let expressions = translate::build(h.family(), cs)?;
    h.stage(MsgBody::DelRule {
        table: table.to_string(),
        chain: chain.to_string(),
        handle,
    })?;
    h.stage(MsgBody::AddRule {
        table: table.to_string(),
        chain: chain.to_string(),
        placement: Placement::AtIndex(num - 1),
        expressions,
    })?;
    Ok(())
}

/// Number of rules in the table jumping or going to `chain`
fn references(listed: &[ChainRules], family: crate::core::family::Family, chain: &str) -> usize {
    listed
        .iter()
        .flat_map(|c| &c.rules)
        .filter_map(|r| translate::parse(family, &r.expressions).ok())
        .filter(|cs| {
            matches!(
                &cs.target,
                Some(Target::Jump(name) | Target::Goto(name)) if name == chain
            )
        })
        .count()
}

/// Renders the current rules of one chain (or the whole table) in list mode
pub fn rule_list(
    h: &mut Session,
    table: &str,
    chain: Option<&str>,
    flags: FormatFlags,
) -> Result<String> {
    let family = h.family();
    let chains = chain_dump(h, Some(table))?;
    let listed = fetch_rules(h, table, None)?;

    let mut out = String::new();
    if !flags.has(FormatFlags::NOTABLE) {
        let _ = writeln!(out, "Table: {table}");
    }
    let mut first = true;
    for c in chains
        .iter()
        .filter(|c| chain.is_none_or(|name| c.name == name))
    {
        if !first {
            out.push('\n');
        }
        first = false;
        let refs = references(&listed, family, &c.name);
        let _ = writeln!(out, "{}", format::list_chain_header(c, refs, flags));
        let _ = writeln!(out, "{}", format::list_captions(flags));
        let rules = listed
            .iter()
            .find(|r| r.chain == c.name)
            .map(|r| r.rules.as_slice())
            .unwrap_or_default();
        for (i, rule) in rules.iter().enumerate() {
            let cs = translate::parse(family, &rule.expressions)?;
            out.push_str(&family.format(&cs, i + 1, flags));
        }
    }
    if let Some(name) = chain
        && first
    {
        return Err(Error::NoSuchChain(name.to_string()));
    }
    Ok(out)
}

/// Current rules of one chain (or the whole table) as save-mode lines
pub fn rule_list_save(
    h: &mut Session,
    table: &str,
    chain: Option<&str>,
    counters: bool,
) -> Result<String> {
    let family = h.family();
    let listed = fetch_rules(h, table, chain)?;
    let mut out = String::new();
    for chain_rules in &listed {
        for rule in &chain_rules.rules {
            let cs = translate::parse(family, &rule.expressions)?;
            let _ = writeln!(out, "{}", format::save_rule(&cs, &chain_rules.chain, counters));
        }
    }
    Ok(out)
}

/// All rules of a table as save-mode lines, chain order preserved
pub fn rule_save(h: &mut Session, table: &str, counters: bool) -> Result<String> {
    rule_list_save(h, table, None, counters)
}

/// Deletes all rules of a chain, or of every chain in the table
pub fn rule_flush(h: &mut Session, table: &str, chain: Option<&str>) -> Result<()> {
    match chain {
        Some(chain) => h.stage(MsgBody::FlushChain {
            table: table.to_string(),
            chain: chain.to_string(),
        })?,
        None => h.stage(MsgBody::FlushTable {
            table: table.to_string(),
        })?,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::family::Family;
    use crate::core::memory::MemoryChannel;
    use crate::core::rule::{MatchExt, Target, builtin_hook};

    fn session_with_filter() -> Session {
        let mut h = Session::open(Family::Ipv4, Box::new(MemoryChannel::new()));
        table_add(&mut h, "filter").unwrap();
        chain_add(
            &mut h,
            "filter",
            "INPUT",
            builtin_hook("filter", "INPUT").unwrap(),
            Verdict::Accept,
            None,
        )
        .unwrap();
        h.commit().unwrap();
        h
    }

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
    fn test_rule_check_after_add_finds_rule() {
        let mut h = session_with_filter();
        let cs = ssh_rule();
        assert!(!rule_check(&mut h, "filter", "INPUT", &cs).unwrap());

        rule_add(&mut h, "filter", "INPUT", &cs, Placement::Append).unwrap();
        h.commit().unwrap();

        assert!(rule_check(&mut h, "filter", "INPUT", &cs).unwrap());
    }

    #[test]
    fn test_rule_delete_num_index_semantics() {
        let mut h = session_with_filter();
        for port in ["22", "80", "443"] {
            let mut cs = ssh_rule();
            cs.matches[0].args[1] = port.to_string();
            rule_add(&mut h, "filter", "INPUT", &cs, Placement::Append).unwrap();
        }
        h.commit().unwrap();

        // 0 and N+1 are out of range
        assert!(matches!(
            rule_delete_num(&mut h, "filter", "INPUT", 0),
            Err(Error::IndexOutOfRange { index: 0, len: 3 })
        ));
        assert!(matches!(
            rule_delete_num(&mut h, "filter", "INPUT", 4),
            Err(Error::IndexOutOfRange { index: 4, len: 3 })
        ));

        rule_delete_num(&mut h, "filter", "INPUT", 2).unwrap();
        h.commit().unwrap();

        let out = rule_save(&mut h, "filter", false).unwrap();
        assert!(out.contains("--dport 22"));
        assert!(!out.contains("--dport 80"));
        assert!(out.contains("--dport 443"));
    }

    #[test]
    fn test_rule_delete_requires_equivalent_rule() {
        let mut h = session_with_filter();
        let err = rule_delete(&mut h, "filter", "INPUT", &ssh_rule()).unwrap_err();
        assert!(matches!(err, Error::NoMatchingRule { .. }));
    }

    #[test]
    fn test_chain_set_rejects_user_chain() {
        let mut h = session_with_filter();
        chain_user_add(&mut h, "filter", "web").unwrap();
        h.commit().unwrap();

        let err = chain_set(&mut h, "filter", "web", Verdict::Drop, None).unwrap_err();
        assert!(matches!(err, Error::NotABaseChain(_)));
    }

    #[test]
    fn test_purge_tolerates_absent_chain() {
        let mut h = session_with_filter();
        chain_user_add(&mut h, "filter", "web").unwrap();
        h.commit().unwrap();

        table_purge_chains(
            &mut h,
            "filter",
            &["web".to_string(), "gone".to_string()],
        )
        .unwrap();
        h.commit().unwrap();

        assert_eq!(chain_dump(&mut h, Some("filter")).unwrap().len(), 1);
    }

    #[test]
    fn test_dormant_flip_keeps_chains() {
        let mut h = session_with_filter();
        table_set_dormant(&mut h, "filter").unwrap();
        h.commit().unwrap();

        let tables = table_list(&mut h).unwrap();
        assert!(tables[0].dormant);
        assert_eq!(chain_dump(&mut h, Some("filter")).unwrap().len(), 1);

        table_wake(&mut h, "filter").unwrap();
        h.commit().unwrap();
        assert!(!table_list(&mut h).unwrap()[0].dormant);
    }
}
