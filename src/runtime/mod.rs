//! The effect interpreter and its supporting machinery.
//!
//! - [`run_loop`]: the trampolined interpreter (crate-internal)
//! - [`frame`]: continuation frames and the pending-continuation stack
//! - [`restart`]: resumption after asynchronous boundaries
//! - [`trampoline`]: current-thread reentrancy-breaking executor
//! - [`pool`]: the worker-pool executor collaborator
//! - [`diagnostic`]: the process-wide diagnostic channel
//!
//! The interpreter is single-threaded per invocation: one worker consumes an
//! effect at a time. Parallelism comes from distinct fibers interpreted on
//! separate pool workers.

pub(crate) mod context;
pub mod diagnostic;
pub(crate) mod frame;
pub mod pool;
pub(crate) mod restart;
pub(crate) mod run_loop;
pub mod trampoline;

pub use pool::{default_pool, Executor, SubmitError, WorkerPool, WorkerPoolOptions};
