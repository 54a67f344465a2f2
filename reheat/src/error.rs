//! Error type for the few operations that can fail loudly.
//!
//! Malformed input never produces an error: every rewrite falls back to
//! returning its input unchanged. What remains are caller defects.

/// Errors returned by `reheat`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lazily-resolved accessor was requested by a name outside the known set.
    #[error("unknown document accessor `{0}` (expected one of: head, body, query)")]
    UnknownAccessor(String),

    /// A query expression could not be parsed.
    #[error("invalid query expression `{expr}`: {reason}")]
    Query { expr: String, reason: String },

    /// A node id does not belong to the document's tree (or was removed).
    #[error("node does not belong to this document")]
    ForeignNode,
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
