use thiserror::Error;

/// Core error types for xtcompat
///
/// Every failure a repository operation can report maps to exactly one
/// variant, so callers can react to "rule not found" differently from
/// "chain in use" without string matching.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport to the classifier engine could not be established or timed out
    #[error("classifier transport unavailable: {0}")]
    ChannelUnavailable(String),

    /// Reply/sequence mismatch on the channel; the session must be torn down
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// Concurrent external mutation detected at commit; re-read and retry
    #[error("ruleset changed by another process; re-read and retry")]
    StaleGeneration,

    /// No rule in the chain matches the given specification
    #[error("no matching rule in chain `{chain}`")]
    NoMatchingRule { chain: String },

    /// Rule index outside the chain's 1-based range
    #[error("index {index} out of range (chain holds {len} rules)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Structural deletion blocked by a live jump reference
    #[error("chain `{0}` is in use by a jump reference")]
    ChainInUse(String),

    /// Policy/counter update attempted on a user chain
    #[error("chain `{0}` is not a base chain")]
    NotABaseChain(String),

    /// Jump target did not resolve to a chain at commit time
    #[error("unknown target `{target}` (batch message {index})")]
    UnknownTarget { target: String, index: usize },

    /// A rule state field has no classifier encoding for the session's family
    #[error("no classifier encoding for {0}")]
    TranslationUnsupported(String),

    /// Batch rejection outside the named taxonomy; nothing was applied
    #[error("batch message {index} rejected: {reason}")]
    BatchRejected { index: usize, reason: String },

    #[error("table `{0}` does not exist")]
    NoSuchTable(String),

    #[error("chain `{0}` does not exist")]
    NoSuchChain(String),

    #[error("chain `{0}` already exists")]
    ChainExists(String),

    /// Save-script parse failure during restore
    #[error("save script line {line}: {message}")]
    Restore { line: usize, message: String },

    /// Input validation failed before anything was staged
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_distinct_per_variant() {
        let not_found = Error::NoMatchingRule {
            chain: "INPUT".to_string(),
        };
        let in_use = Error::ChainInUse("web".to_string());

        assert!(not_found.to_string().contains("no matching rule"));
        assert!(in_use.to_string().contains("in use"));
        assert_ne!(not_found.to_string(), in_use.to_string());
    }

    #[test]
    fn test_index_error_reports_bounds() {
        let err = Error::IndexOutOfRange { index: 7, len: 3 };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
