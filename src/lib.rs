//! Pureio: a purely functional effect runtime for Rust.
//!
//! # Overview
//!
//! Pureio lets programs build first-class, referentially transparent
//! descriptions of computations ("effects") and interpret them with
//! well-defined semantics for sequencing, error handling, asynchrony,
//! cancellation, and concurrency. Building an effect does nothing; the
//! trampolined run loop gives it meaning.
//!
//! # Core Guarantees
//!
//! - **Stack safety**: arbitrarily nested binds, maps, and recoveries run in
//!   constant native-stack depth
//! - **Cooperative cancellation**: a cancelled scope stops the loop at the
//!   next poll boundary or asynchronous resumption; finalizers run in LIFO
//!   order, exactly once
//! - **At-most-once callbacks**: an async producer that fires twice has the
//!   second invocation dropped, with a diagnostic if it carried an error
//! - **Bounded concurrency**: the parallel traversal operator never lets
//!   more than its limit of effects past the permit gate
//!
//! # Module Structure
//!
//! - [`effect`]: the `Effect<A>` type, constructors, and combinators
//! - [`runtime`]: the interpreter, trampoline, worker pool, diagnostics
//! - [`cancel`]: cooperative cancellation scopes
//! - [`sync`]: `Deferred`, `Ref`, `Semaphore`
//! - [`fiber`]: forked interpretations with join and cancel
//! - [`combinator`]: `race`, `par_map2`, bounded traversal
//! - [`time`]: timer collaborator hooks
//! - [`app`]: main-entry facade with exit codes
//! - [`error`]: error types
//!
//! # Example
//!
//! ```
//! use pureio::{Effect, Ref};
//!
//! let counter = Ref::new(0);
//! let tally = counter.clone();
//! let program = Effect::pure(2)
//!     .flat_map(move |n| tally.update(move |c| c + n))
//!     .and_then(counter.get());
//! assert_eq!(program.run_sync().unwrap(), 2);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod app;
pub mod cancel;
pub mod combinator;
pub mod effect;
pub mod error;
pub mod fiber;
pub mod runtime;
pub mod sync;
#[cfg(feature = "tracing-integration")]
pub mod test_utils;
pub mod time;
pub mod tracing_compat;

// Re-exports for convenient access to core types
pub use app::{run_main, ExitCode};
pub use cancel::CancelScope;
pub use combinator::{
    par_map2, parallel_replicate_n, parallel_sequence_n, parallel_traverse_n, race, race_pair,
    Either, RacePair,
};
pub use effect::{AsyncCallback, Effect};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use fiber::{start, Fiber};
pub use runtime::{default_pool, Executor, SubmitError, WorkerPool, WorkerPoolOptions};
pub use sync::{Deferred, Ref, Semaphore};
pub use time::{ThreadTimer, Timer};
