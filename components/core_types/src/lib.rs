//! Core value and error types for the Skald scripting runtime.
//!
//! This crate provides the foundational types shared by every other
//! component of the runtime:
//!
//! - [`Value`] - NaN-boxed representation of script values
//! - [`ObjId`] / [`SymbolId`] - arena and symbol-table indices
//! - [`VmError`] / [`ErrorKind`] - the host-facing error model
//!
//! # Examples
//!
//! ```
//! use core_types::Value;
//!
//! let n = Value::from_number(42.0);
//! assert!(n.is_number());
//! assert_eq!(n.as_number(), 42.0);
//!
//! // 0.0 is truthy in Skald; only nil and false are not.
//! assert!(Value::from_number(0.0).is_truthy());
//! assert!(!Value::NIL.is_truthy());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;
mod ids;
mod value;

pub use error::{ErrorKind, VmError, VmResult};
pub use ids::{ObjId, SymbolId};
pub use value::{fmt_number, Value};
