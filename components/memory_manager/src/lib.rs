//! Heap and garbage collector for the Skald runtime.
//!
//! Every script object lives in an arena owned by a single VM
//! instance; values reference objects by arena index. The collector is
//! a stop-the-world mark-and-sweep with a deferred finalization queue
//! for objects whose class defines a script `dtor`.
//!
//! - [`object`] - the heap object variants and sparse symbol slots
//! - [`Heap`] - arena, byte accounting, temp roots, collection
//! - [`HandlePool`] - host-held GC roots that outlive a single API call

#![warn(missing_docs)]
#![warn(clippy::all)]

mod handle;
mod heap;
pub mod object;

pub use handle::{Handle, HandlePool};
pub use heap::{CollectStats, GcRoots, Heap, MARK_FINALIZE, MARK_REACHABLE, MARK_SCHEDULED, MARK_UNREACHABLE, TEMP_ROOT_CAPACITY};
