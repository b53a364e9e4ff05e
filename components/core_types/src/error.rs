//! The host-facing error model.
//!
//! Every fallible runtime operation reports a [`VmError`] carrying one
//! of the flat [`ErrorKind`] codes. The three stack-trace kinds never
//! appear on a returned error; they exist only as markers delivered to
//! the host's error hook while a runtime error unwinds.

use std::fmt;

/// The flat enumeration of error codes a host can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A collection or handle allocation could not be satisfied.
    OutOfMemory,
    /// Script execution failed (bad operand types, missing symbol,
    /// calling a non-callable, ...).
    Runtime,
    /// The lexer hit an invalid character or unterminated comment.
    Lexer,
    /// The parser rejected the source text.
    Compile,
    /// A function was called with the wrong number of arguments.
    FunctionArityMismatch,
    /// A module with that name already exists.
    ModuleAlreadyDefined,
    /// No module with that name is registered.
    ModuleNotFound,
    /// An API operation was applied to a value of the wrong type.
    InvalidOpOnType,
    /// An API argument was out of range.
    InvalidArgument,
    /// Error-hook marker: a stack trace follows.
    StackTraceBegin,
    /// Error-hook marker: one frame of a stack trace.
    StackTrace,
    /// Error-hook marker: the stack trace is complete.
    StackTraceEnd,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Runtime => "runtime error",
            ErrorKind::Lexer => "lexer error",
            ErrorKind::Compile => "compile error",
            ErrorKind::FunctionArityMismatch => "function arity mismatch",
            ErrorKind::ModuleAlreadyDefined => "module already defined",
            ErrorKind::ModuleNotFound => "module not found",
            ErrorKind::InvalidOpOnType => "invalid operation on type",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::StackTraceBegin => "stack trace begin",
            ErrorKind::StackTrace => "stack trace",
            ErrorKind::StackTraceEnd => "stack trace end",
        };
        f.write_str(name)
    }
}

/// An error produced by the runtime, with a user-readable message and
/// the source line it was observed on when one is known.
#[derive(Debug, Clone)]
pub struct VmError {
    /// What failed.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// 1-based source line, when the error has one.
    pub line: Option<u32>,
}

impl VmError {
    /// Builds an error without line information.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> VmError {
        VmError {
            kind,
            message: message.into(),
            line: None,
        }
    }

    /// Builds an error tagged with a source line.
    pub fn with_line(kind: ErrorKind, line: u32, message: impl Into<String>) -> VmError {
        VmError {
            kind,
            message: message.into(),
            line: Some(line),
        }
    }

    /// Shorthand for a [`ErrorKind::Runtime`] error.
    pub fn runtime(message: impl Into<String>) -> VmError {
        VmError::new(ErrorKind::Runtime, message)
    }

    /// Shorthand for a [`ErrorKind::Compile`] error.
    pub fn compile(line: u32, message: impl Into<String>) -> VmError {
        VmError::with_line(ErrorKind::Compile, line, message)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {}): {}", self.kind, line, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for VmError {}

/// Result alias used across the runtime crates.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VmError::compile(12, "unexpected token");
        assert_eq!(err.to_string(), "compile error (line 12): unexpected token");

        let err = VmError::runtime("not callable");
        assert_eq!(err.to_string(), "runtime error: not callable");
    }

    #[test]
    fn test_error_kind_round() {
        let err = VmError::new(ErrorKind::ModuleNotFound, "std:nope");
        assert_eq!(err.kind, ErrorKind::ModuleNotFound);
        assert!(err.line.is_none());
    }
}
