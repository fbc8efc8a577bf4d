//! Effect-level synchronization primitives.
//!
//! - [`Deferred`]: single-assignment cell; readers suspend until set
//! - [`Ref`]: mutable cell whose operations are effects
//! - [`Semaphore`]: counting semaphore with fair FIFO waiters
//!
//! All handles are `Clone` and share their underlying state; the effects
//! they hand out are descriptions, so nothing happens until interpretation.

pub mod deferred;
pub mod ref_cell;
pub mod semaphore;

pub use deferred::{deferred, Deferred};
pub use ref_cell::Ref;
pub use semaphore::Semaphore;
