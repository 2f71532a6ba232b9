//! Diagnostics.
//!
//! The backend never renders errors itself. Every problem worth telling the
//! user about is packaged as a `Diagnostic` (stable code, severity, source
//! location, message, optional help and note) and handed to a `Reporter`
//! supplied by the embedder. The `Diagnostics` collector in this module is
//! the reporter used by the driver and by tests.

use crate::ast::Span;
use core::fmt;

/// Stable diagnostic codes.
///
/// The taxonomy is part of the compiler's external interface; tools match on
/// these names. Do not renumber or rename.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorCode {
    // Type checking.
    UnboundVariable,
    TypeMismatch,
    ArityMismatch,
    OccursCheck,
    ImmutableAssignment,
    UnsupportedOperation,
    TypeAnnotationRequired,
    // Lowering.
    TooManyLocals,
    RegisterPressureExhausted,
    JumpOutOfRange,
    ControlFlowOutsideLoop,
    UndefinedLabel,
    // Invariant violations inside the compiler itself.
    CompilerBug,
}

impl ErrorCode {
    /// The stable string form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnboundVariable => "UnboundVariable",
            Self::TypeMismatch => "TypeMismatch",
            Self::ArityMismatch => "ArityMismatch",
            Self::OccursCheck => "OccursCheck",
            Self::ImmutableAssignment => "ImmutableAssignment",
            Self::UnsupportedOperation => "UnsupportedOperation",
            Self::TypeAnnotationRequired => "TypeAnnotationRequired",
            Self::TooManyLocals => "TooManyLocals",
            Self::RegisterPressureExhausted => "RegisterPressureExhausted",
            Self::JumpOutOfRange => "JumpOutOfRange",
            Self::ControlFlowOutsideLoop => "ControlFlowOutsideLoop",
            Self::UndefinedLabel => "UndefinedLabel",
            Self::CompilerBug => "CompilerBug",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Severity {
    Error,
    Warning,
}

/// One diagnostic.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// Stable code.
    pub code: ErrorCode,
    /// Severity.
    pub severity: Severity,
    /// Where in the source the problem is.
    pub span: Span,
    /// Primary message.
    pub message: String,
    /// Optional suggestion.
    pub help: Option<String>,
    /// Optional additional context.
    pub note: Option<String>,
}

impl Diagnostic {
    /// A new error diagnostic.
    pub fn error(code: ErrorCode, span: Span, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Error,
            span,
            message: message.into(),
            help: None,
            note: None,
        }
    }

    /// Attach a help suggestion.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Attach a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.span, self.message, self.code)
    }
}

/// Where diagnostics go. Implemented by the embedder's renderer; the
/// compiler only calls `report`.
pub trait Reporter {
    /// Deliver one diagnostic.
    fn report(&mut self, diagnostic: Diagnostic);
}

/// A reporter that collects diagnostics in order.
#[derive(Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
    error_count: usize,
}

impl Diagnostics {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of error-severity diagnostics seen.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Were any errors reported?
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// All diagnostics in report order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    /// Consume the collector, yielding the diagnostics.
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.list
    }
}

impl Reporter for Diagnostics {
    fn report(&mut self, diagnostic: Diagnostic) {
        log::debug!("diagnostic: {}", diagnostic);
        if diagnostic.severity == Severity::Error {
            self.error_count += 1;
        }
        self.list.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_counts_errors() {
        let mut diags = Diagnostics::new();
        assert!(!diags.has_errors());
        diags.report(Diagnostic::error(
            ErrorCode::UnboundVariable,
            Span::none(),
            "undefined variable `x`",
        ));
        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.iter().next().unwrap().code, ErrorCode::UnboundVariable);
    }
}
