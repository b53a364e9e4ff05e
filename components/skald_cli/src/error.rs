//! Error types for the CLI.

use core_types::VmError;
use std::fmt;

/// CLI-level errors.
#[derive(Debug)]
pub enum CliError {
    /// The VM reported an error (compile or runtime).
    Vm(VmError),
    /// A file could not be read.
    Io(std::io::Error),
    /// The interactive editor failed.
    Repl(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Vm(err) => write!(f, "{}", err),
            CliError::Io(err) => write!(f, "file error: {}", err),
            CliError::Repl(message) => write!(f, "repl error: {}", message),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<VmError> for CliError {
    fn from(err: VmError) -> Self {
        CliError::Vm(err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io(err)
    }
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;
