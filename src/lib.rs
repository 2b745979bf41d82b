//! xtcompat - legacy packet-filter rules over a declarative classifier
//!
//! A translation and transactional-application engine: legacy line-oriented
//! filter rules (ordered chains in named tables, each rule a conjunction of
//! protocol/address/interface matches plus a terminal action and counters)
//! are expressed through a classifier engine with an expression-tree rule
//! model, programmed over a sequenced, batched request/response channel.
//!
//! # Architecture
//!
//! - [`core`] - Translation codec, session/batch transactions, repository
//!   operations, formatting, save/restore
//! - [`audit`] - Audit logging of ruleset mutations
//! - [`validators`] - Input validation for names reaching the ruleset
//! - [`config`] - Declared tables/chains and configuration persistence
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Guarantees
//!
//! - Lossless round trip: rules built by the translator parse back to an
//!   equivalent legacy rule state
//! - Atomic application: a batch either lands completely or not at all
//! - Byte-stable save output: save → restore → save is identical

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use crate::core::error::{Error, Result};
pub use crate::core::family::Family;
pub use crate::core::rule::RuleState;
pub use crate::core::session::Session;
