//! Sequenced message channel to the classifier engine
//!
//! The transport itself is an external collaborator; this module defines the
//! contract the core needs from it: typed messages carrying strictly
//! increasing sequence numbers, grouped into batches that the engine applies
//! atomically, and replies correlated back by sequence number.
//!
//! [`MemoryChannel`](crate::core::memory::MemoryChannel) is the in-tree
//! implementation used by tests and the CLI.

use crate::core::error::Result;
use crate::core::expr::{Expression, Verdict};
use crate::core::rule::{Chain, Counters, Hook, Rule, Table};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where an added rule lands within its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Chain tail
    Append,
    /// Immediately before the rule with this handle
    BeforeHandle(u64),
    /// At this 0-based position (used by replace)
    AtIndex(usize),
}

/// One request message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MsgBody {
    /// Opens an atomically-applied batch; carries the generation the sender
    /// last observed so the engine can detect concurrent mutation
    BatchBegin { generation: Option<u64> },
    /// Closes the batch
    BatchEnd,

    AddTable {
        table: String,
    },
    SetDormant {
        table: String,
        dormant: bool,
    },
    /// Creates a chain, or updates policy/counters of an existing one with
    /// the same hook attachment
    AddChain {
        table: String,
        chain: String,
        hook: Option<Hook>,
        policy: Option<Verdict>,
        counters: Option<Counters>,
    },
    SetChain {
        table: String,
        chain: String,
        policy: Verdict,
        counters: Option<Counters>,
    },
    RenameChain {
        table: String,
        chain: String,
        newname: String,
    },
    DelChain {
        table: String,
        chain: String,
    },
    AddRule {
        table: String,
        chain: String,
        placement: Placement,
        expressions: Vec<Expression>,
    },
    DelRule {
        table: String,
        chain: String,
        handle: u64,
    },
    FlushChain {
        table: String,
        chain: String,
    },
    FlushTable {
        table: String,
    },

    ListTables,
    ListChains {
        table: Option<String>,
    },
    ListRules {
        table: String,
        chain: Option<String>,
    },
}

impl MsgBody {
    /// Read requests run outside a batch as a single request/reply pair
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            MsgBody::ListTables | MsgBody::ListChains { .. } | MsgBody::ListRules { .. }
        )
    }
}

/// A sequenced message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: u32,
    pub body: MsgBody,
}

/// Engine-side rejection reasons carried in replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    UnknownTarget { target: String },
    ChainInUse { chain: String },
    NoSuchTable { table: String },
    NoSuchChain { chain: String },
    NoSuchRule { handle: u64 },
    Exists { name: String },
    StaleGeneration,
    Invalid { detail: String },
}

/// Rules of one chain, in evaluation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRules {
    pub chain: String,
    pub rules: Vec<Rule>,
}

/// One reply message, correlated by the request's sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ack {
        seq: u32,
    },
    Rejected {
        seq: u32,
        reason: RejectReason,
    },
    Tables {
        seq: u32,
        generation: u64,
        tables: Vec<Table>,
    },
    Chains {
        seq: u32,
        generation: u64,
        chains: Vec<Chain>,
    },
    Rules {
        seq: u32,
        generation: u64,
        rules: Vec<ChainRules>,
    },
}

impl Reply {
    pub fn seq(&self) -> u32 {
        match self {
            Reply::Ack { seq }
            | Reply::Rejected { seq, .. }
            | Reply::Tables { seq, .. }
            | Reply::Chains { seq, .. }
            | Reply::Rules { seq, .. } => *seq,
        }
    }

    /// Ruleset generation observed by a read reply, if any
    pub fn generation(&self) -> Option<u64> {
        match self {
            Reply::Tables { generation, .. }
            | Reply::Chains { generation, .. }
            | Reply::Rules { generation, .. } => Some(*generation),
            Reply::Ack { .. } | Reply::Rejected { .. } => None,
        }
    }
}

/// Opaque, sequenced, acknowledged message transport
///
/// `send` accepts a whole batch (or a single read request) and returns a
/// correlation id; `receive` blocks until the reply set for that correlation
/// id is available or the timeout elapses. Replies arrive in request order;
/// anything else is a protocol fault the session treats as fatal.
pub trait Channel {
    fn send(&mut self, batch: &[Message]) -> Result<u32>;
    fn receive(&mut self, correlation: u32, timeout: Duration) -> Result<Vec<Reply>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_message_classification() {
        assert!(MsgBody::ListTables.is_read());
        assert!(
            MsgBody::ListRules {
                table: "filter".into(),
                chain: None
            }
            .is_read()
        );
        assert!(
            !MsgBody::AddTable {
                table: "filter".into()
            }
            .is_read()
        );
        assert!(!MsgBody::BatchBegin { generation: None }.is_read());
    }

    #[test]
    fn test_reply_generation_only_on_reads() {
        assert_eq!(Reply::Ack { seq: 1 }.generation(), None);
        let tables = Reply::Tables {
            seq: 2,
            generation: 7,
            tables: vec![],
        };
        assert_eq!(tables.generation(), Some(7));
        assert_eq!(tables.seq(), 2);
    }
}
