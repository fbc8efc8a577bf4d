//! Concurrency combinators over effects.
//!
//! - [`race`] / [`race_pair`]: first-completion-wins over two effects
//! - [`par_map2`]: combine two effects evaluated in parallel
//! - [`parallel_traverse_n`] and friends: bounded concurrent traversal

pub mod race;
pub mod traverse;

pub use race::{race, race_pair, Either, RacePair};
pub use traverse::{par_map2, parallel_replicate_n, parallel_sequence_n, parallel_traverse_n};
