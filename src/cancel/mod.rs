//! Cooperative cancellation scopes.
//!
//! A [`CancelScope`] is the mutable token threaded through one
//! interpretation (and shared with whoever may cancel it). It records
//! finalizer effects in LIFO order, a monotonic cancelled flag, and a nested
//! mask depth. Cancellation is cooperative: marking the scope cancelled
//! makes the run loop stop at its next poll boundary and suppresses the
//! next asynchronous resumption; it never preempts.
//!
//! # Masking
//!
//! Inside a masked region the scope reports not-cancelled to the loop and
//! drops finalizer registrations. A cancel issued meanwhile is latched and
//! observed at the first poll after the mask is lifted.
//!
//! # Invariant
//!
//! Once cancelled, a scope is done: finalizers registered afterwards are
//! dropped, and a second cancel observes an empty finalizer stack.

use crate::effect::{Effect, Node};
use crate::error::Error;
use crate::runtime::diagnostic;
use crate::tracing_compat::trace;
use std::sync::{Arc, Mutex as StdMutex};

/// A shareable cancellation scope.
///
/// Cloning shares the underlying scope; all mutation happens on a
/// consistent snapshot under the internal lock.
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    state: StdMutex<ScopeState>,
}

struct ScopeState {
    /// Monotonic: false → true, never back.
    cancelled: bool,
    /// Positive depth means cancellation is masked.
    mask_depth: u32,
    /// Finalizers in registration order; run back-to-front.
    finalizers: Vec<Node>,
}

impl CancelScope {
    /// Creates a fresh, uncancelled, unmasked scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                state: StdMutex::new(ScopeState {
                    cancelled: false,
                    mask_depth: 0,
                    finalizers: Vec::new(),
                }),
            }),
        }
    }

    /// Whether two handles refer to the same scope.
    #[must_use]
    pub fn same(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Reports the cancelled flag as seen by the run loop: a masked scope
    /// reads as not cancelled even if a cancel is pending.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let state = self.lock();
        state.cancelled && state.mask_depth == 0
    }

    /// Whether cancellation is currently masked.
    #[must_use]
    pub fn is_masked(&self) -> bool {
        self.lock().mask_depth > 0
    }

    /// Enters a masked region. Nests.
    pub fn push_mask(&self) {
        self.lock().mask_depth += 1;
    }

    /// Leaves a masked region.
    pub fn pop_mask(&self) {
        let mut state = self.lock();
        state.mask_depth = state.mask_depth.saturating_sub(1);
    }

    /// Registers a finalizer. Dropped if the scope is cancelled or masked.
    pub(crate) fn push(&self, finalizer: Node) {
        let mut state = self.lock();
        if state.cancelled || state.mask_depth > 0 {
            trace!(
                cancelled = state.cancelled,
                masked = state.mask_depth > 0,
                "finalizer registration dropped"
            );
            return;
        }
        state.finalizers.push(finalizer);
    }

    /// Removes and returns the most recent finalizer, or a unit node if the
    /// stack is empty.
    pub(crate) fn pop(&self) -> Node {
        self.lock()
            .finalizers
            .pop()
            .unwrap_or_else(|| Node::Pure(Box::new(())))
    }

    /// Number of registered finalizers.
    #[must_use]
    pub fn finalizer_count(&self) -> usize {
        self.lock().finalizers.len()
    }

    /// Returns an effect that marks the scope cancelled and runs the
    /// pending finalizers in LIFO order.
    ///
    /// The effect completes only after the finalizers have finished. The
    /// first finalizer failure is surfaced; later ones go to the diagnostic
    /// channel. Cancelling twice is harmless: the second effect observes an
    /// empty stack.
    #[must_use = "the cancel effect must be run for finalizers to execute"]
    pub fn cancel(&self) -> Effect<()> {
        let scope = self.clone();
        Effect::suspend(move || {
            let finalizers = {
                let mut state = scope.lock();
                if state.cancelled {
                    Vec::new()
                } else {
                    state.cancelled = true;
                    std::mem::take(&mut state.finalizers)
                }
            };
            if finalizers.is_empty() {
                return Effect::unit();
            }
            trace!(count = finalizers.len(), "running cancellation finalizers");
            run_finalizers(finalizers)
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        self.inner.state.lock().expect("cancel scope poisoned")
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CancelScope")
            .field("cancelled", &state.cancelled)
            .field("mask_depth", &state.mask_depth)
            .field("finalizers", &state.finalizers.len())
            .finish()
    }
}

/// Sequences finalizers back-to-front with first-error-wins semantics.
fn run_finalizers(finalizers: Vec<Node>) -> Effect<()> {
    let mut acc: Effect<Option<Error>> = Effect::pure(None);
    for finalizer in finalizers.into_iter().rev() {
        let effect = Effect::<()>::from_node(finalizer);
        acc = acc.flat_map(move |first| {
            effect.attempt().map(move |outcome| match (first, outcome) {
                (None, Ok(())) => None,
                (None, Err(error)) => Some(error),
                (Some(first), Ok(())) => Some(first),
                (Some(first), Err(error)) => {
                    diagnostic::report_finalizer_error(&error);
                    Some(first)
                }
            })
        });
    }
    acc.flat_map(|first| match first {
        None => Effect::unit(),
        Some(error) => Effect::raise_error(error),
    })
}
