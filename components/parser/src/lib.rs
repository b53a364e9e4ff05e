//! The Skald compiler front end.
//!
//! Compilation is single-pass: the Pratt parser drives the function
//! builder directly, emitting register bytecode while it reads tokens.
//! There is no AST. Because the compiler creates real heap objects as
//! it goes (strings, functions, classes), it talks to the runtime
//! through the [`CompileHost`] trait; the interpreter crate implements
//! it for the VM.
//!
//! - [`lexer`] - byte stream to tokens
//! - [`builder`] - scopes, constants, instruction emission
//! - [`CompileHost`] - the seam to the runtime
//! - [`compile_module`] - the entry point

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod builder;
mod host;
pub mod lexer;
mod parse;

pub use builder::{FnProto, FunctionBuilder, INVALID_SLOT};
pub use host::CompileHost;
pub use parse::compile_module;
