//! Forked interpretations.
//!
//! [`start`] submits an effect to the worker pool as an independent
//! interpretation with its own cancellation scope and no shared
//! continuation state. The handle exposes `join` (a [`Deferred`] read of
//! the outcome) and `cancel` (the scope's cancel effect).
//!
//! Starting a fiber happens-before anything the fiber observes; fiber
//! completion happens-before `join` returns. No ordering holds between
//! unrelated fibers.

use crate::cancel::CancelScope;
use crate::effect::{unbox, Effect};
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::pool::{self, Executor};
use crate::runtime::run_loop;
use crate::sync::deferred::Deferred;
use crate::tracing_compat::trace;

/// A handle to a forked interpretation.
///
/// Handles are `Clone`; all clones observe the same fiber.
pub struct Fiber<A> {
    scope: CancelScope,
    join_cell: Deferred<Result<A>>,
}

impl<A> Clone for Fiber<A> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            join_cell: self.join_cell.clone(),
        }
    }
}

impl<A: Clone + Send + 'static> Fiber<A> {
    pub(crate) fn from_parts(scope: CancelScope, join_cell: Deferred<Result<A>>) -> Self {
        Self { scope, join_cell }
    }

    /// An effect producing the fiber's outcome, suspending until it
    /// terminates. A fiber stopped by cancellation never terminates, so its
    /// joiners suspend indefinitely; compose a race externally if that
    /// matters.
    #[must_use]
    pub fn join(&self) -> Effect<A> {
        self.join_cell.get().flat_map(Effect::from_result)
    }

    /// An effect cancelling the fiber. Idempotent; completes only after the
    /// fiber's finalizers have finished.
    #[must_use]
    pub fn cancel(&self) -> Effect<()> {
        self.scope.cancel()
    }

    /// The fiber's cancellation scope.
    #[must_use]
    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }
}

impl<A> std::fmt::Debug for Fiber<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Forks `effect` onto the worker pool and hands back its [`Fiber`].
///
/// The child shares no continuation state with its parent; only the
/// returned handle connects them.
#[must_use]
pub fn start<A: Clone + Send + 'static>(effect: Effect<A>) -> Effect<Fiber<A>> {
    Effect::suspend(move || {
        let scope = CancelScope::new();
        let join_cell: Deferred<Result<A>> = Deferred::new();

        let loop_scope = scope.clone();
        let loop_cell = join_cell.clone();
        let node = effect.into_node();
        let task = Box::new(move || {
            run_loop::run(
                node,
                loop_scope,
                Box::new(move |outcome| {
                    let _ = loop_cell.complete_now(outcome.map(unbox::<A>));
                }),
            );
        });

        match pool::default_pool().submit(task) {
            Ok(()) => {
                trace!("fiber started");
                Effect::pure(Fiber::from_parts(scope, join_cell))
            }
            Err(error) => Effect::raise_error(
                Error::new(ErrorKind::Internal)
                    .with_context("fiber submission rejected")
                    .with_source(error),
            ),
        }
    })
}
