//! In-memory classifier engine
//!
//! A deterministic implementation of the [`Channel`] contract holding the
//! whole ruleset in process memory. Tests and the CLI run against it instead
//! of a live kernel, so nothing here needs privileges and every behavior is
//! reproducible.
//!
//! Batches apply atomically: every message is validated and applied against
//! a scratch copy of the state, and the copy replaces the live state only if
//! the whole batch succeeds. A generation counter bumps on every committed
//! batch; a batch opened against an older observed generation is rejected
//! wholesale so concurrent-mutation races surface instead of interleaving.
//!
//! Cloning a `MemoryChannel` shares the underlying state, which is how a
//! second session (or the CLI's persistence handle) sees the same ruleset.

use crate::core::channel::{
    Channel, ChainRules, Message, MsgBody, Placement, RejectReason, Reply,
};
use crate::core::error::{Error, Result};
use crate::core::expr::{Expression, Verdict};
use crate::core::rule::{Chain, Counters, Hook, Rule, Table};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KRule {
    handle: u64,
    expressions: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KChain {
    name: String,
    hook: Option<Hook>,
    policy: Option<Verdict>,
    counters: Counters,
    rules: Vec<KRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KTable {
    name: String,
    dormant: bool,
    chains: Vec<KChain>,
}

/// Whole-engine state: tables, the handle allocator, and the generation
/// counter checked at batch begin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct KernelState {
    tables: Vec<KTable>,
    next_handle: u64,
    generation: u64,
}

impl KernelState {
    fn table(&self, name: &str) -> Option<&KTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn table_mut(&mut self, name: &str) -> std::result::Result<&mut KTable, RejectReason> {
        self.tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| RejectReason::NoSuchTable {
                table: name.to_string(),
            })
    }

    fn chain_mut(
        &mut self,
        table: &str,
        chain: &str,
    ) -> std::result::Result<&mut KChain, RejectReason> {
        self.table_mut(table)?
            .chains
            .iter_mut()
            .find(|c| c.name == chain)
            .ok_or_else(|| RejectReason::NoSuchChain {
                chain: chain.to_string(),
            })
    }

    /// Chain names referenced by jump/goto immediates in `exprs`
    fn jump_targets(exprs: &[Expression]) -> impl Iterator<Item = &str> {
        exprs.iter().filter_map(|e| match e {
            Expression::Immediate { verdict } => verdict.chain(),
            _ => None,
        })
    }

    fn apply(&mut self, body: &MsgBody) -> std::result::Result<(), RejectReason> {
        match body {
            // Brackets and reads are handled by the channel, not here
            MsgBody::BatchBegin { .. }
            | MsgBody::BatchEnd
            | MsgBody::ListTables
            | MsgBody::ListChains { .. }
            | MsgBody::ListRules { .. } => Ok(()),

            MsgBody::AddTable { table } => {
                if self.table(table).is_none() {
                    self.tables.push(KTable {
                        name: table.clone(),
                        dormant: false,
                        chains: Vec::new(),
                    });
                }
                Ok(())
            }
            MsgBody::SetDormant { table, dormant } => {
                // Flag flip only; chains and rules stay loaded
                self.table_mut(table)?.dormant = *dormant;
                Ok(())
            }
            MsgBody::AddChain {
                table,
                chain,
                hook,
                policy,
                counters,
            } => {
                let t = self.table_mut(table)?;
                if let Some(existing) = t.chains.iter_mut().find(|c| c.name == *chain) {
                    if existing.hook != *hook {
                        return Err(RejectReason::Invalid {
                            detail: format!("chain `{chain}` exists with a different hook"),
                        });
                    }
                    if policy.is_some() {
                        existing.policy = *policy;
                    }
                    if let Some(counters) = counters {
                        existing.counters = *counters;
                    }
                } else {
                    t.chains.push(KChain {
                        name: chain.clone(),
                        hook: *hook,
                        policy: *policy,
                        counters: counters.unwrap_or_default(),
                        rules: Vec::new(),
                    });
                }
                Ok(())
            }
            MsgBody::SetChain {
                table,
                chain,
                policy,
                counters,
            } => {
                let c = self.chain_mut(table, chain)?;
                if c.hook.is_none() {
                    return Err(RejectReason::Invalid {
                        detail: format!("chain `{chain}` has no hook"),
                    });
                }
                c.policy = Some(*policy);
                if let Some(counters) = counters {
                    c.counters = *counters;
                }
                Ok(())
            }
            MsgBody::RenameChain {
                table,
                chain,
                newname,
            } => {
                let t = self.table_mut(table)?;
                if t.chains.iter().any(|c| c.name == *newname) {
                    return Err(RejectReason::Exists {
                        name: newname.clone(),
                    });
                }
                let c = t
                    .chains
                    .iter_mut()
                    .find(|c| c.name == *chain)
                    .ok_or_else(|| RejectReason::NoSuchChain {
                        chain: chain.clone(),
                    })?;
                c.name = newname.clone();
                Ok(())
            }
            MsgBody::DelChain { table, chain } => {
                let t = self.table_mut(table)?;
                if !t.chains.iter().any(|c| c.name == *chain) {
                    return Err(RejectReason::NoSuchChain {
                        chain: chain.clone(),
                    });
                }
                let referenced = t.chains.iter().any(|c| {
                    c.name != *chain
                        && c.rules
                            .iter()
                            .any(|r| KernelState::jump_targets(&r.expressions).any(|j| j == chain))
                });
                if referenced {
                    return Err(RejectReason::ChainInUse {
                        chain: chain.clone(),
                    });
                }
                t.chains.retain(|c| c.name != *chain);
                Ok(())
            }
            MsgBody::AddRule {
                table,
                chain,
                placement,
                expressions,
            } => {
                // Jump targets resolve against the table as it stands at this
                // point in the batch
                let t = self.table_mut(table)?;
                for target in KernelState::jump_targets(expressions) {
                    if !t.chains.iter().any(|c| c.name == target) {
                        return Err(RejectReason::UnknownTarget {
                            target: target.to_string(),
                        });
                    }
                }
                let handle = self.next_handle + 1;
                let c = self.chain_mut(table, chain)?;
                let rule = KRule {
                    handle,
                    expressions: expressions.clone(),
                };
                match placement {
                    Placement::Append => c.rules.push(rule),
                    Placement::BeforeHandle(h) => {
                        let pos = c
                            .rules
                            .iter()
                            .position(|r| r.handle == *h)
                            .ok_or(RejectReason::NoSuchRule { handle: *h })?;
                        c.rules.insert(pos, rule);
                    }
                    Placement::AtIndex(i) => {
                        if *i > c.rules.len() {
                            return Err(RejectReason::Invalid {
                                detail: format!("insert position {i} past end of chain"),
                            });
                        }
                        c.rules.insert(*i, rule);
                    }
                }
                self.next_handle = handle;
                Ok(())
            }
            MsgBody::DelRule {
                table,
                chain,
                handle,
            } => {
                let c = self.chain_mut(table, chain)?;
                let pos = c
                    .rules
                    .iter()
                    .position(|r| r.handle == *handle)
                    .ok_or(RejectReason::NoSuchRule { handle: *handle })?;
                c.rules.remove(pos);
                Ok(())
            }
            MsgBody::FlushChain { table, chain } => {
                self.chain_mut(table, chain)?.rules.clear();
                Ok(())
            }
            MsgBody::FlushTable { table } => {
                for c in &mut self.table_mut(table)?.chains {
                    c.rules.clear();
                }
                Ok(())
            }
        }
    }

    fn list_tables(&self) -> Vec<Table> {
        self.tables
            .iter()
            .map(|t| Table {
                name: t.name.clone(),
                dormant: t.dormant,
            })
            .collect()
    }

    fn list_chains(&self, table: Option<&str>) -> Vec<Chain> {
        self.tables
            .iter()
            .filter(|t| table.is_none_or(|name| t.name == name))
            .flat_map(|t| {
                t.chains.iter().map(|c| Chain {
                    name: c.name.clone(),
                    table: t.name.clone(),
                    hook: c.hook,
                    policy: c.policy,
                    counters: c.counters,
                })
            })
            .collect()
    }

    fn list_rules(
        &self,
        table: &str,
        chain: Option<&str>,
    ) -> std::result::Result<Vec<ChainRules>, RejectReason> {
        let t = self.table(table).ok_or_else(|| RejectReason::NoSuchTable {
            table: table.to_string(),
        })?;
        if let Some(chain) = chain
            && !t.chains.iter().any(|c| c.name == chain)
        {
            return Err(RejectReason::NoSuchChain {
                chain: chain.to_string(),
            });
        }
        Ok(t.chains
            .iter()
            .filter(|c| chain.is_none_or(|name| c.name == name))
            .map(|c| ChainRules {
                chain: c.name.clone(),
                rules: c
                    .rules
                    .iter()
                    .map(|r| Rule {
                        handle: r.handle,
                        expressions: r.expressions.clone(),
                    })
                    .collect(),
            })
            .collect())
    }
}

/// In-memory [`Channel`] implementation; clones share the engine state
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    kernel: Rc<RefCell<KernelState>>,
    pending: Rc<RefCell<Vec<(u32, Vec<Reply>)>>>,
    next_correlation: Rc<RefCell<u32>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads persisted engine state; a missing file yields a fresh ruleset
    pub fn load(path: &Path) -> Result<Self> {
        let chan = Self::new();
        match std::fs::read_to_string(path) {
            Ok(json) => {
                *chan.kernel.borrow_mut() = serde_json::from_str(&json)?;
                Ok(chan)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(chan),
            Err(e) => Err(Error::ChannelUnavailable(format!(
                "cannot read state file {}: {e}",
                path.display()
            ))),
        }
    }

    /// Persists engine state with the temp-file-then-rename pattern
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.kernel.borrow())?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn process(&self, batch: &[Message]) -> Vec<Reply> {
        let mut replies = Vec::with_capacity(batch.len());

        // A lone read request short-circuits without touching state
        if let [msg] = batch
            && msg.body.is_read()
        {
            let kernel = self.kernel.borrow();
            let generation = kernel.generation;
            let seq = msg.seq;
            let reply = match &msg.body {
                MsgBody::ListTables => Reply::Tables {
                    seq,
                    generation,
                    tables: kernel.list_tables(),
                },
                MsgBody::ListChains { table } => Reply::Chains {
                    seq,
                    generation,
                    chains: kernel.list_chains(table.as_deref()),
                },
                MsgBody::ListRules { table, chain } => {
                    match kernel.list_rules(table, chain.as_deref()) {
                        Ok(rules) => Reply::Rules {
                            seq,
                            generation,
                            rules,
                        },
                        Err(reason) => Reply::Rejected { seq, reason },
                    }
                }
                _ => unreachable!("is_read covers exactly the list bodies"),
            };
            return vec![reply];
        }

        // Mutating batch: validate and apply on a scratch copy, swap on success
        let mut scratch = self.kernel.borrow().clone();
        for msg in batch {
            if let MsgBody::BatchBegin {
                generation: Some(observed),
            } = &msg.body
                && *observed != scratch.generation
            {
                replies.push(Reply::Rejected {
                    seq: msg.seq,
                    reason: RejectReason::StaleGeneration,
                });
                return replies;
            }
            match scratch.apply(&msg.body) {
                Ok(()) => replies.push(Reply::Ack { seq: msg.seq }),
                Err(reason) => {
                    // Scratch copy is dropped; nothing from this batch lands
                    replies.push(Reply::Rejected { seq: msg.seq, reason });
                    return replies;
                }
            }
        }
        scratch.generation += 1;
        debug!(generation = scratch.generation, messages = batch.len(), "batch applied");
        *self.kernel.borrow_mut() = scratch;
        replies
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, batch: &[Message]) -> Result<u32> {
        let correlation = {
            let mut next = self.next_correlation.borrow_mut();
            *next += 1;
            *next
        };
        let replies = self.process(batch);
        self.pending.borrow_mut().push((correlation, replies));
        Ok(correlation)
    }

    fn receive(&mut self, correlation: u32, _timeout: Duration) -> Result<Vec<Reply>> {
        let mut pending = self.pending.borrow_mut();
        let pos = pending
            .iter()
            .position(|(c, _)| *c == correlation)
            .ok_or_else(|| {
                Error::ProtocolDesync(format!("no reply set for correlation {correlation}"))
            })?;
        Ok(pending.remove(pos).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::VerdictSpec;

    fn msg(seq: u32, body: MsgBody) -> Message {
        Message { seq, body }
    }

    fn filter_with_input() -> MemoryChannel {
        let mut chan = MemoryChannel::new();
        let batch = [
            msg(1, MsgBody::BatchBegin { generation: None }),
            msg(
                2,
                MsgBody::AddTable {
                    table: "filter".into(),
                },
            ),
            msg(
                3,
                MsgBody::AddChain {
                    table: "filter".into(),
                    chain: "INPUT".into(),
                    hook: crate::core::rule::builtin_hook("filter", "INPUT"),
                    policy: Some(Verdict::Accept),
                    counters: None,
                },
            ),
            msg(4, MsgBody::BatchEnd),
        ];
        let corr = chan.send(&batch).unwrap();
        let replies = chan.receive(corr, Duration::from_secs(1)).unwrap();
        assert!(replies.iter().all(|r| matches!(r, Reply::Ack { .. })));
        chan
    }

    #[test]
    fn test_batch_applies_atomically() {
        let mut chan = filter_with_input();

        // Second message fails (unknown jump target): first must not land
        let batch = [
            msg(10, MsgBody::BatchBegin { generation: None }),
            msg(
                11,
                MsgBody::AddRule {
                    table: "filter".into(),
                    chain: "INPUT".into(),
                    placement: Placement::Append,
                    expressions: vec![Expression::Counter {
                        packets: 0,
                        bytes: 0,
                    }],
                },
            ),
            msg(
                12,
                MsgBody::AddRule {
                    table: "filter".into(),
                    chain: "INPUT".into(),
                    placement: Placement::Append,
                    expressions: vec![Expression::Immediate {
                        verdict: VerdictSpec::Jump("missing".into()),
                    }],
                },
            ),
            msg(13, MsgBody::BatchEnd),
        ];
        let corr = chan.send(&batch).unwrap();
        let replies = chan.receive(corr, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            replies.last(),
            Some(Reply::Rejected {
                reason: RejectReason::UnknownTarget { .. },
                ..
            })
        ));

        let corr = chan
            .send(&[msg(
                20,
                MsgBody::ListRules {
                    table: "filter".into(),
                    chain: Some("INPUT".into()),
                },
            )])
            .unwrap();
        let replies = chan.receive(corr, Duration::from_secs(1)).unwrap();
        let Reply::Rules { rules, .. } = &replies[0] else {
            panic!("expected rules reply");
        };
        assert!(rules[0].rules.is_empty());
    }

    #[test]
    fn test_generation_check_rejects_stale_batch() {
        let mut chan = filter_with_input();
        let observed = chan.kernel.borrow().generation;

        // A shared clone mutates the ruleset in between
        let mut other = chan.clone();
        let batch = [
            msg(30, MsgBody::BatchBegin { generation: None }),
            msg(
                31,
                MsgBody::AddChain {
                    table: "filter".into(),
                    chain: "web".into(),
                    hook: None,
                    policy: None,
                    counters: None,
                },
            ),
            msg(32, MsgBody::BatchEnd),
        ];
        let corr = other.send(&batch).unwrap();
        other.receive(corr, Duration::from_secs(1)).unwrap();

        let stale = [
            msg(
                40,
                MsgBody::BatchBegin {
                    generation: Some(observed),
                },
            ),
            msg(
                41,
                MsgBody::FlushChain {
                    table: "filter".into(),
                    chain: "INPUT".into(),
                },
            ),
            msg(42, MsgBody::BatchEnd),
        ];
        let corr = chan.send(&stale).unwrap();
        let replies = chan.receive(corr, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            replies[0],
            Reply::Rejected {
                reason: RejectReason::StaleGeneration,
                ..
            }
        ));
    }

    #[test]
    fn test_chain_in_use_blocks_delete() {
        let mut chan = filter_with_input();
        let batch = [
            msg(50, MsgBody::BatchBegin { generation: None }),
            msg(
                51,
                MsgBody::AddChain {
                    table: "filter".into(),
                    chain: "web".into(),
                    hook: None,
                    policy: None,
                    counters: None,
                },
            ),
            msg(
                52,
                MsgBody::AddRule {
                    table: "filter".into(),
                    chain: "INPUT".into(),
                    placement: Placement::Append,
                    expressions: vec![Expression::Immediate {
                        verdict: VerdictSpec::Jump("web".into()),
                    }],
                },
            ),
            msg(53, MsgBody::BatchEnd),
        ];
        let corr = chan.send(&batch).unwrap();
        assert!(
            chan.receive(corr, Duration::from_secs(1))
                .unwrap()
                .iter()
                .all(|r| matches!(r, Reply::Ack { .. }))
        );

        let del = [
            msg(60, MsgBody::BatchBegin { generation: None }),
            msg(
                61,
                MsgBody::DelChain {
                    table: "filter".into(),
                    chain: "web".into(),
                },
            ),
            msg(62, MsgBody::BatchEnd),
        ];
        let corr = chan.send(&del).unwrap();
        let replies = chan.receive(corr, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            replies.last(),
            Some(Reply::Rejected {
                reason: RejectReason::ChainInUse { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_rule_handles_are_stable_not_positional() {
        let mut chan = filter_with_input();
        let add = |seq, n: u64| {
            msg(
                seq,
                MsgBody::AddRule {
                    table: "filter".into(),
                    chain: "INPUT".into(),
                    placement: Placement::Append,
                    expressions: vec![Expression::Counter {
                        packets: n,
                        bytes: 0,
                    }],
                },
            )
        };
        let batch = [
            msg(70, MsgBody::BatchBegin { generation: None }),
            add(71, 1),
            add(72, 2),
            add(73, 3),
            msg(74, MsgBody::BatchEnd),
        ];
        let corr = chan.send(&batch).unwrap();
        chan.receive(corr, Duration::from_secs(1)).unwrap();

        let handles = |chan: &mut MemoryChannel| -> Vec<u64> {
            let corr = chan
                .send(&[msg(
                    80,
                    MsgBody::ListRules {
                        table: "filter".into(),
                        chain: Some("INPUT".into()),
                    },
                )])
                .unwrap();
            let replies = chan.receive(corr, Duration::from_secs(1)).unwrap();
            let Reply::Rules { rules, .. } = &replies[0] else {
                panic!("expected rules reply");
            };
            rules[0].rules.iter().map(|r| r.handle).collect()
        };

        let before = handles(&mut chan);
        let del = [
            msg(90, MsgBody::BatchBegin { generation: None }),
            msg(
                91,
                MsgBody::DelRule {
                    table: "filter".into(),
                    chain: "INPUT".into(),
                    handle: before[0],
                },
            ),
            msg(92, MsgBody::BatchEnd),
        ];
        let corr = chan.send(&del).unwrap();
        chan.receive(corr, Duration::from_secs(1)).unwrap();

        // Remaining handles keep their values; only positions shift
        assert_eq!(handles(&mut chan), before[1..].to_vec());
    }
}
