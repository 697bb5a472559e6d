//! Error types for grammar loading, generation and model persistence.
//!
//! Grammar defects are fatal at load time: a malformed rule file is a
//! precondition violation, not something to recover from at runtime.
//! Generation errors are local and retryable; the generator escalates them
//! as explicit `Result` values so the caller can retry with nonrecursive
//! creators at the right level instead of unwinding through the stack.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while parsing or validating a grammar definition.
///
/// Any of these aborts startup.
#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing rule `{line}`: {message}")]
    Rule { line: String, message: String },

    #[error("unknown directive `!{name}`")]
    UnknownDirective { name: String },

    #[error("bad argument to `!{directive}`: {message}")]
    DirectiveArgument { directive: String, message: String },

    #[error("empty tag encountered in `{line}`")]
    EmptyTag { line: String },

    #[error("range error in `{tag}` tag: min {min} > max {max}")]
    Range { tag: String, min: i64, max: i64 },

    #[error("unknown callback function `{name}`")]
    UnknownFunction { name: String },

    #[error("unknown import `{name}`")]
    UnknownImport { name: String },

    #[error("no creators for symbol `{symbol}`")]
    NoCreators { symbol: String },

    #[error("no root symbol defined")]
    NoRoot,
}

/// Retryable conditions hit while expanding a symbol.
///
/// Both variants take the same escalation path: the caller retries the
/// subtree with nonrecursive creators if it can, otherwise the whole
/// output unit is abandoned and regenerated.
#[derive(Debug, Error)]
pub enum GenError {
    #[error("maximum recursion depth {depth} reached while expanding `{symbol}`")]
    RecursionLimit { symbol: String, depth: usize },

    #[error("no valid creator found for `{symbol}` after {attempts} resample attempts")]
    OracleExhausted { symbol: String, attempts: usize },

    #[error("no creators for symbol `{symbol}`")]
    NoCreators { symbol: String },

    #[error("code rule for `{symbol}` produced no fresh variable of that type")]
    NoFreshVariable { symbol: String },

    #[error("range error in `{tag}` tag")]
    Range { tag: String },

    #[error("unknown import `{name}`")]
    UnknownImport { name: String },

    #[error("unknown callback function `{name}`")]
    UnknownFunction { name: String },

    #[error("no root symbol defined")]
    NoRoot,
}

impl GenError {
    /// Whether the immediate caller may retry this expansion with
    /// nonrecursive-only creators.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenError::RecursionLimit { .. } | GenError::OracleExhausted { .. }
        )
    }
}

/// Errors around model and training artifact persistence.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("bad magic in {path}: expected {expected:?}")]
    Magic { path: PathBuf, expected: [u8; 4] },

    #[error("unsupported format version {found} in {path} (expected {expected})")]
    Version {
        path: PathBuf,
        found: u16,
        expected: u16,
    },
}
