//! Shared test utilities for core module tests
//!
//! Common helpers so test suites agree on how a session, a seeded table and
//! a canonical rule look. Only compiled in test mode.

use crate::core::channel::{Channel, Message, Reply};
use crate::core::error::Result;
use crate::core::expr::Verdict;
use crate::core::family::Family;
use crate::core::memory::MemoryChannel;
use crate::core::repo;
use crate::core::rule::{MatchExt, RuleState, Target, builtin_hook};
use crate::core::session::Session;
use std::time::Duration;

/// Session over a fresh in-memory engine
pub fn fresh_session(family: Family) -> Session {
    Session::open(family, Box::new(MemoryChannel::new()))
}

/// Session plus a shared handle to the same engine, for tests that need a
/// second observer or mutator
pub fn shared_session(family: Family) -> (Session, MemoryChannel) {
    let channel = MemoryChannel::new();
    let engine = channel.clone();
    (Session::open(family, Box::new(channel)), engine)
}

/// IPv4 session with `filter`/`INPUT` (hook input, policy accept) committed
pub fn filter_session() -> Session {
    let mut h = fresh_session(Family::Ipv4);
    repo::table_add(&mut h, "filter").unwrap();
    repo::chain_add(
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

/// The canonical test rule: `-p tcp --dport 22 -j ACCEPT`
pub fn ssh_rule() -> RuleState {
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

/// Channel wrapper that corrupts reply sequence numbers, for exercising the
/// session's desync handling
pub struct ScrambledChannel {
    inner: MemoryChannel,
}

impl ScrambledChannel {
    pub fn new() -> Self {
        Self {
            inner: MemoryChannel::new(),
        }
    }
}

impl Channel for ScrambledChannel {
    fn send(&mut self, batch: &[Message]) -> Result<u32> {
        self.inner.send(batch)
    }

    fn receive(&mut self, correlation: u32, timeout: Duration) -> Result<Vec<Reply>> {
        let mut replies = self.inner.receive(correlation, timeout)?;
        // Duplicate the first reply's sequence number onto the last
        if let (Some(first), len @ 2..) = (replies.first().map(Reply::seq), replies.len()) {
            if let Reply::Ack { seq } = &mut replies[len - 1] {
                *seq = first;
            }
        }
        Ok(replies)
    }
}
