//! Result and error types for the compilation pipeline.

use crate::diagnostic::Diagnostic;
use thiserror::Error;

/// A fatal compilation error.
///
/// Type errors are collected and reported through the `Reporter` before the
/// pipeline halts; the error value then only carries the count. Lowering
/// errors are fatal at the first occurrence and carry their diagnostic.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// Type checking failed; the diagnostics went to the reporter.
    #[error("type checking failed with {0} error(s)")]
    TypeCheck(usize),

    /// Lowering failed; the same diagnostic went to the reporter.
    #[error("{0}")]
    Lowering(Diagnostic),

    /// An internal invariant was violated.
    #[error("compiler bug: {0}")]
    Bug(String),
}

/// A convenient alias for a `Result` with `CodegenError`.
pub type CodegenResult<T> = Result<T, CodegenError>;
