//! Core rule-translation and transaction engine
//!
//! This module contains the codec between legacy rule state and the
//! classifier's expression model, and the lifecycle operations over the
//! batched channel. It provides:
//!
//! - [`expr`]: the classifier expression model
//! - [`rule`]: legacy rule state and ruleset entities
//! - [`family`]: per-family translation strategies
//! - [`translate`]: the rule state ⇄ expression list codec
//! - [`channel`]: the sequenced message channel contract
//! - [`memory`]: in-memory engine backing tests and the CLI
//! - [`session`]: session and batch transaction engine
//! - [`repo`]: table/chain/rule repository operations
//! - [`format`]: list- and save-mode output
//! - [`save`]: save-script emit and restore
//! - [`error`]: error types for all of the above

pub mod channel;
pub mod error;
pub mod expr;
pub mod family;
pub mod format;
pub mod memory;
pub mod repo;
pub mod rule;
pub mod save;
pub mod session;
pub mod translate;

#[cfg(test)]
pub mod test_helpers;
