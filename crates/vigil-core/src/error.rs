//! Error types for rule compilation.

use thiserror::Error;

/// Per-line rule compilation failure.
///
/// A parse error never aborts a batch load; the loader counts it and moves
/// on to the next line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The line reduced to an empty pattern after stripping anchors.
    #[error("empty pattern")]
    EmptyPattern,

    /// An option after `$` is not one the engine understands.
    #[error("unknown rule option: {0}")]
    UnknownOption(String),

    /// A `domain=` list contained no usable domains.
    #[error("empty or invalid domain list")]
    BadDomainList,

    /// An element-hiding line had no selector after `##`/`#@#`.
    #[error("missing element-hiding selector")]
    BadSelector,
}

/// Result type for rule compilation.
pub type Result<T> = std::result::Result<T, ParseError>;
