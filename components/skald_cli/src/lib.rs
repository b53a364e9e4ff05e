//! Command-line host for the Skald runtime.
//!
//! This crate is a reference embedder: it owns the I/O the core never
//! performs. The print hook writes to stdout, the error hook to
//! stderr, and the module hook resolves `import` names against the
//! entry script's directory with the `.sk` extension.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod repl;
mod runtime;

pub use error::{CliError, CliResult};
pub use repl::run_repl;
pub use runtime::Runtime;

use clap::Parser;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "skald", version, about = "The Skald scripting language")]
pub struct Cli {
    /// Script file to execute.
    pub file: Option<String>,

    /// Evaluate inline source text.
    #[arg(short, long)]
    pub eval: Option<String>,

    /// Start the interactive REPL.
    #[arg(long)]
    pub repl: bool,

    /// Print the compiled bytecode of executed modules.
    #[arg(long)]
    pub dump_bytecode: bool,
}
