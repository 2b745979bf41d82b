//! Session and batch transaction engine
//!
//! A [`Session`] owns the channel, the monotonic sequence counter, the
//! selected family strategy and at most one open [`Batch`]. Repository
//! operations stage mutation messages into the batch; nothing reaches the
//! engine until [`Session::commit`] sends the whole batch bracketed by
//! begin/end markers. Either every staged message is accepted or the error
//! names the first failing message and nothing is applied.
//!
//! The batch is an explicit state machine (Building → Sent → Committed /
//! Aborted / Rejected) rather than a pair of calls the caller must remember
//! to balance. A session dropped with an open batch aborts it implicitly and
//! logs a warning.

use crate::core::channel::{Channel, Message, MsgBody, RejectReason, Reply};
use crate::core::error::{Error, Result};
use crate::core::family::Family;
use std::time::Duration;
use tracing::{debug, warn};

/// How long `commit` and read requests wait for the reply set
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Building,
    Sent,
    Committed,
    Aborted,
    Rejected,
}

/// Pending mutation messages plus the reserved begin-marker sequence number
#[derive(Debug)]
pub struct Batch {
    begin_seq: u32,
    messages: Vec<Message>,
    state: BatchState,
}

impl Batch {
    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// One per process invocation; exclusively owned by the invoking procedure
pub struct Session {
    family: Family,
    seq: u32,
    channel: Box<dyn Channel>,
    batch: Option<Batch>,
    committed: bool,
    /// Generation last observed through a read; stamped into the next
    /// batch-begin so the engine can detect concurrent mutation
    generation: Option<u64>,
    /// Set on a reply/sequence fault; every later operation fails
    desynced: bool,
    /// (table, old name) pairs renamed inside the open batch
    renamed: Vec<(String, String)>,
}

impl Session {
    /// Opens a session over an established channel with the given family
    /// strategy. Family selection is fixed for the session's lifetime.
    pub fn open(family: Family, channel: Box<dyn Channel>) -> Self {
        debug!(%family, "session opened");
        Self {
            family,
            seq: 0,
            channel,
            batch: None,
            committed: false,
            generation: None,
            desynced: false,
            renamed: Vec::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// True once a commit has been accepted in this session
    pub fn committed(&self) -> bool {
        self.committed
    }

    pub fn has_open_batch(&self) -> bool {
        self.batch
            .as_ref()
            .is_some_and(|b| b.state == BatchState::Building)
    }

    /// Messages staged in the open batch
    pub fn pending(&self) -> usize {
        self.batch.as_ref().map_or(0, Batch::len)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    fn check_live(&self) -> Result<()> {
        if self.desynced {
            return Err(Error::ProtocolDesync(
                "session is desynced and must be torn down".to_string(),
            ));
        }
        Ok(())
    }

    /// Opens a batch if none is open; reuses the current one otherwise
    pub fn begin_batch(&mut self) {
        if !self.has_open_batch() {
            let begin_seq = self.next_seq();
            self.batch = Some(Batch {
                begin_seq,
                messages: Vec::new(),
                state: BatchState::Building,
            });
        }
    }

    /// Appends a mutation message to the current batch; never sends.
    /// Returns the assigned sequence number.
    pub fn stage(&mut self, body: MsgBody) -> Result<u32> {
        self.check_live()?;
        self.begin_batch();

        // A chain renamed earlier in this batch must not be referenced by its
        // old name later in the same batch; ordering would be a guess.
        match &body {
            MsgBody::AddRule {
                table, expressions, ..
            } => {
                for e in expressions {
                    if let crate::core::expr::Expression::Immediate { verdict } = e
                        && let Some(target) = verdict.chain()
                        && self
                            .renamed
                            .iter()
                            .any(|(t, old)| t == table && old == target)
                    {
                        return Err(Error::ProtocolDesync(format!(
                            "chain `{target}` was renamed earlier in this batch"
                        )));
                    }
                }
            }
            MsgBody::RenameChain { table, chain, .. } => {
                self.renamed.push((table.clone(), chain.clone()));
            }
            _ => {}
        }

        let seq = self.next_seq();
        let batch = self.batch.as_mut().expect("begin_batch opened a batch");
        batch.messages.push(Message { seq, body });
        Ok(seq)
    }

    /// Sends the batch bracketed by begin/end markers and consumes exactly
    /// one reply set. On rejection the error names the first failing staged
    /// message; no enclosed message is applied either way.
    pub fn commit(&mut self) -> Result<()> {
        self.check_live()?;
        let Some(mut batch) = self.batch.take() else {
            debug!("commit with no open batch is a no-op");
            return Ok(());
        };
        self.renamed.clear();
        if batch.messages.is_empty() {
            batch.state = BatchState::Committed;
            self.committed = true;
            return Ok(());
        }

        let mut framed = Vec::with_capacity(batch.messages.len() + 2);
        framed.push(Message {
            seq: batch.begin_seq,
            body: MsgBody::BatchBegin {
                generation: self.generation,
            },
        });
        framed.append(&mut batch.messages);
        let end_seq = self.next_seq();
        framed.push(Message {
            seq: end_seq,
            body: MsgBody::BatchEnd,
        });

        batch.state = BatchState::Sent;
        let correlation = self.channel.send(&framed)?;
        let replies = self.channel.receive(correlation, REPLY_TIMEOUT)?;
        self.verify_reply_order(&framed, &replies)?;

        for (pos, reply) in replies.iter().enumerate() {
            if let Reply::Rejected { reason, .. } = reply {
                batch.state = BatchState::Rejected;
                // Index among the staged messages; the begin marker is pos 0
                let index = pos.saturating_sub(1);
                debug!(index, "batch rejected");
                return Err(map_reject(reason.clone(), index));
            }
        }
        if replies.len() != framed.len() {
            self.desynced = true;
            return Err(Error::ProtocolDesync(format!(
                "expected {} replies, got {}",
                framed.len(),
                replies.len()
            )));
        }

        batch.state = BatchState::Committed;
        self.committed = true;
        // Observed generation is stale after our own mutation
        self.generation = None;
        debug!(messages = framed.len() - 2, "batch committed");
        Ok(())
    }

    /// Discards the batch unsent; always succeeds
    pub fn abort(&mut self) {
        if let Some(mut batch) = self.batch.take() {
            batch.state = BatchState::Aborted;
            debug!(messages = batch.len(), "batch aborted");
        }
        self.renamed.clear();
    }

    /// Single read request/reply pair, outside any batch
    pub fn request(&mut self, body: MsgBody) -> Result<Reply> {
        self.check_live()?;
        debug_assert!(body.is_read(), "request() is for read operations");
        let seq = self.next_seq();
        let msg = [Message { seq, body }];
        let correlation = self.channel.send(&msg)?;
        let mut replies = self.channel.receive(correlation, REPLY_TIMEOUT)?;
        if replies.len() != 1 || replies[0].seq() != seq {
            self.desynced = true;
            return Err(Error::ProtocolDesync(format!(
                "read request {seq} answered with {} replies (first seq {:?})",
                replies.len(),
                replies.first().map(Reply::seq)
            )));
        }
        let reply = replies.remove(0);
        if let Reply::Rejected { reason, .. } = reply {
            return Err(map_reject(reason, 0));
        }
        if let Some(generation) = reply.generation() {
            self.generation = Some(generation);
        }
        Ok(reply)
    }

    fn verify_reply_order(&mut self, sent: &[Message], replies: &[Reply]) -> Result<()> {
        let mut last = 0u32;
        for (reply, msg) in replies.iter().zip(sent) {
            let seq = reply.seq();
            if seq != msg.seq || seq <= last {
                self.desynced = true;
                return Err(Error::ProtocolDesync(format!(
                    "reply sequence {seq} does not match request {}",
                    msg.seq
                )));
            }
            last = seq;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.has_open_batch() {
            // Caller bug: neither commit nor abort ran before teardown
            warn!("session dropped with an open batch; aborting implicitly");
            self.abort();
        }
    }
}

fn map_reject(reason: RejectReason, index: usize) -> Error {
    match reason {
        RejectReason::UnknownTarget { target } => Error::UnknownTarget { target, index },
        RejectReason::ChainInUse { chain } => Error::ChainInUse(chain),
        RejectReason::NoSuchTable { table } => Error::NoSuchTable(table),
        RejectReason::NoSuchChain { chain } => Error::NoSuchChain(chain),
        RejectReason::NoSuchRule { handle } => Error::BatchRejected {
            index,
            reason: format!("no rule with handle {handle}"),
        },
        RejectReason::Exists { name } => Error::ChainExists(name),
        RejectReason::StaleGeneration => Error::StaleGeneration,
        RejectReason::Invalid { detail } => Error::BatchRejected {
            index,
            reason: detail,
        },
    }
}
