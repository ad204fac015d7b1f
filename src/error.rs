//! Universal error type for the crate
use thiserror::Error;

/// Universal error type
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    /// A node handle refers to a cache entry that no longer exists,
    /// typically because [`Cache::reset`](crate::Cache::reset) was called
    /// while the handle was still live.
    #[error("node is not present in this `Cache`")]
    CacheInvalidated,

    /// `pow` / `nth-root` was compiled with a non-constant exponent, or an
    /// opcode that cannot be built through the generic entry point
    /// (`affine`, `dummy-a`, `dummy-b`, `invalid`) was requested.
    #[error("operand is not valid for this operation")]
    InvalidOperand,

    /// The root clause could not be located while compiling the tape.
    #[error("root clause is missing from the compiled tape")]
    MalformedTree,

    /// `pop` was called on an evaluator with no matching `push`.
    #[error("`pop` called with no matching `push`")]
    UnbalancedStack,

    /// Unknown opcode name in the flat text format.
    #[error("unknown opcode {0}")]
    UnknownOpcode(String),

    /// Operand reference in the flat text format that was never defined.
    #[error("unknown variable {0}")]
    UnknownVariable(String),

    /// The flat text format contained no nodes.
    #[error("empty file")]
    EmptyFile,
}
