//! First-class effect descriptions.
//!
//! An [`Effect<A>`] is a pure, lazily built description of a computation that
//! eventually produces an `A` or fails with an [`Error`]. Building an effect
//! has no side effect; interpretation happens only through the entry points
//! ([`Effect::run_sync`], [`Effect::run_async`], [`Effect::run_cancellable`])
//! or by forking a fiber.
//!
//! # Shape
//!
//! Internally an effect is a tagged tree (`Node`) consumed by the trampolined
//! run loop in [`crate::runtime`]. The public surface is fully typed; values
//! cross the interpreter type-erased and are restored at each continuation
//! frame.
//!
//! # Ownership
//!
//! Effects own their continuations. An effect value is consumed by one
//! interpretation; handles that are meant to be shared ([`crate::Fiber`],
//! [`crate::Deferred`], [`crate::Ref`]) are `Clone` and hand out fresh
//! effects on demand.

use crate::cancel::CancelScope;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::diagnostic;
use crate::runtime::frame::Frame;
use crate::runtime::pool::{self, Executor};
use crate::runtime::restart::RestartCallback;
use crate::runtime::run_loop;
use crate::tracing_compat::debug;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// A type-erased effect value in flight through the interpreter.
pub(crate) type AnyValue = Box<dyn Any + Send>;

/// A thunk producing a value synchronously.
pub(crate) type Thunk = Box<dyn FnOnce() -> AnyValue + Send>;

/// A thunk producing the next node (recursion point).
pub(crate) type NodeThunk = Box<dyn FnOnce() -> Node + Send>;

/// A continuation from a value to the next node.
pub(crate) type BindFn = Box<dyn FnOnce(AnyValue) -> Node + Send>;

/// A continuation from a value to a value.
pub(crate) type MapFn = Box<dyn FnOnce(AnyValue) -> AnyValue + Send>;

/// An error-recovery continuation.
pub(crate) type ErrFn = Box<dyn FnOnce(Error) -> Node + Send>;

/// An asynchronous producer. Must arrange for the restart callback to be
/// invoked exactly once; extra invocations are dropped.
pub(crate) type Producer = Box<dyn FnOnce(&CancelScope, Arc<RestartCallback>) + Send>;

/// Rewrites the active cancellation scope.
pub(crate) type ModifyFn = Box<dyn FnOnce(&CancelScope) -> CancelScope + Send>;

/// Restores a cancellation scope when the wrapped node completes or fails.
/// Applied on either the success or the failure path, never both.
pub(crate) type RestoreFn = Arc<dyn Fn(&CancelScope, &CancelScope) -> CancelScope + Send + Sync>;

/// The effect AST. A closed sum consumed by the run loop with dense
/// pattern-match dispatch; never extended via trait objects.
pub(crate) enum Node {
    /// Already-evaluated value.
    Pure(AnyValue),
    /// Produce a value by running the thunk; panics are captured.
    Delay(Thunk),
    /// Produce the next node by running the thunk; enables recursion.
    Suspend(NodeThunk),
    /// Unconditional failure.
    RaiseError(Error),
    /// Sequential composition. The frame may be a plain bind or a handler.
    Bind(Box<Node>, Frame),
    /// Bind whose continuation returns a value rather than a node.
    Map(Box<Node>, MapFn),
    /// Asynchronous boundary. The producer receives the active scope and the
    /// restart callback; `trampoline_after` breaks synchronous callback
    /// chains by re-entering the loop through the trampoline.
    Async {
        /// The producer invoked off the loop.
        producer: Producer,
        /// Whether resumption goes through the trampoline.
        trampoline_after: bool,
    },
    /// Rewrite the active cancellation scope around `next`.
    ContextSwitch {
        /// The node interpreted under the modified scope.
        next: Box<Node>,
        /// Applied before `next` is entered.
        modify: ModifyFn,
        /// Applied as a bind frame on both outcome paths.
        restore: Option<RestoreFn>,
    },
}

/// Restores a type-erased value to its concrete type.
///
/// The typed [`Effect`] API guarantees the downcast at each frame; a failure
/// here is an interpreter bug, not a user error.
pub(crate) fn unbox<A: 'static>(value: AnyValue) -> A {
    match value.downcast::<A>() {
        Ok(boxed) => *boxed,
        Err(_) => unreachable!("effect value arrived at a frame with an unexpected type"),
    }
}

/// An effect lifting one mask level from the active scope.
fn pop_mask_effect() -> Effect<()> {
    Effect::from_node(Node::ContextSwitch {
        next: Box::new(Node::Pure(Box::new(()))),
        modify: Box::new(|scope| {
            scope.pop_mask();
            scope.clone()
        }),
        restore: None,
    })
}

/// A cancellation token registered before it exists.
///
/// `cancellable` must have its finalizer on the scope before the producer
/// runs (a producer may complete inline, and completion pops the
/// registration). The slot is registered empty and filled with the
/// producer's token afterwards; a cancel arriving in between runs the token
/// detached once it shows up.
#[derive(Clone)]
struct ForwardCancel {
    slot: Arc<StdMutex<ForwardState>>,
}

enum ForwardState {
    /// No token yet, no cancel request yet.
    Empty,
    /// The finalizer ran before the token arrived.
    Requested,
    /// The producer's token, waiting for a cancel.
    Token(Node),
}

impl ForwardCancel {
    fn new() -> Self {
        Self {
            slot: Arc::new(StdMutex::new(ForwardState::Empty)),
        }
    }

    /// The node registered on the scope as the boundary's finalizer.
    fn finalizer_node(&self) -> Node {
        let slot = Arc::clone(&self.slot);
        Node::Suspend(Box::new(move || {
            let state = {
                let mut state = slot.lock().expect("forward cancel slot poisoned");
                std::mem::replace(&mut *state, ForwardState::Requested)
            };
            match state {
                ForwardState::Token(node) => node,
                ForwardState::Empty | ForwardState::Requested => Node::Pure(Box::new(())),
            }
        }))
    }

    /// Stores the producer's token; if a cancel already claimed the slot,
    /// runs the token detached.
    fn fill(&self, token: Node) {
        let mut state = self.slot.lock().expect("forward cancel slot poisoned");
        if matches!(&*state, ForwardState::Requested) {
            drop(state);
            run_loop::run_detached(token);
        } else {
            *state = ForwardState::Token(token);
        }
    }
}

/// Shared state between a bracket's acquisition path and its cancellation
/// finalizer. Serializes the "who releases" decision.
struct BracketGate<A, R> {
    state: StdMutex<GateState<A>>,
    release: StdMutex<Option<R>>,
}

enum GateState<A> {
    /// Acquire has not completed and the finalizer has not run.
    Pending,
    /// The finalizer ran; a late acquisition must release inline.
    Finalized,
    /// The resource is held; the finalizer releases it.
    Acquired(A),
}

impl<A, R> BracketGate<A, R> {
    fn take_release(&self) -> Option<R> {
        self.release.lock().expect("bracket gate poisoned").take()
    }
}

/// A finalizer that can be claimed by exactly one of several paths
/// (normal exit or cancellation). Claiming is serialized; the losers
/// observe a no-op.
#[derive(Clone)]
struct SharedFinalizer {
    slot: Arc<StdMutex<Option<Node>>>,
}

impl SharedFinalizer {
    fn new(fin: Effect<()>) -> Self {
        Self {
            slot: Arc::new(StdMutex::new(Some(fin.node))),
        }
    }

    /// An effect that runs the finalizer if it has not been claimed yet.
    fn to_effect(&self) -> Effect<()> {
        let slot = Arc::clone(&self.slot);
        Effect::from_node(Node::Suspend(Box::new(move || {
            let taken = slot.lock().expect("finalizer slot poisoned").take();
            taken.unwrap_or(Node::Pure(Box::new(())))
        })))
    }
}

/// A pure description of a computation producing an `A`.
///
/// See the [module documentation](self) for the overall model.
pub struct Effect<A> {
    node: Node,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Send + 'static> Effect<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }

    /// Lifts an already-evaluated value.
    #[must_use]
    pub fn pure(value: A) -> Self {
        Self::from_node(Node::Pure(Box::new(value)))
    }

    /// Defers a synchronous computation. Panics inside the thunk are caught
    /// and raised as [`ErrorKind::Panicked`] errors.
    #[must_use]
    pub fn delay(thunk: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_node(Node::Delay(Box::new(move || Box::new(thunk()))))
    }

    /// Defers the construction of an effect. The canonical recursion point:
    /// the thunk runs on the interpreter's heap-backed stack, so arbitrarily
    /// deep recursion through `suspend` is safe.
    #[must_use]
    pub fn suspend(thunk: impl FnOnce() -> Effect<A> + Send + 'static) -> Self {
        Self::from_node(Node::Suspend(Box::new(move || thunk().node)))
    }

    /// An effect that fails unconditionally.
    #[must_use]
    pub fn raise_error(error: Error) -> Self {
        Self::from_node(Node::RaiseError(error))
    }

    /// Lifts a result into an effect.
    #[must_use]
    pub fn from_result(result: Result<A>) -> Self {
        match result {
            Ok(a) => Self::pure(a),
            Err(e) => Self::raise_error(e),
        }
    }

    /// An asynchronous effect. The producer receives a callback and must
    /// arrange for it to be completed exactly once, on any thread; extra
    /// completions are dropped (with a diagnostic if the dropped result was
    /// an error).
    #[must_use]
    pub fn async_(producer: impl FnOnce(AsyncCallback<A>) + Send + 'static) -> Self {
        Self::from_node(Node::Async {
            producer: Box::new(move |_scope, restart| {
                producer(AsyncCallback::new(restart));
            }),
            trampoline_after: false,
        })
    }

    /// An asynchronous effect whose producer returns a cancellation effect.
    ///
    /// The returned effect is registered as a finalizer on the active scope
    /// and runs if the interpretation is cancelled while suspended at this
    /// boundary; completion unregisters it. The registration happens through
    /// a forward slot installed before the producer runs, so a producer that
    /// completes inline never leaves a stale token behind. Resumption goes
    /// through the trampoline so producers that complete inline cannot grow
    /// the native stack.
    #[must_use]
    pub fn cancellable(
        producer: impl FnOnce(AsyncCallback<A>) -> Effect<()> + Send + 'static,
    ) -> Self {
        Self::from_node(Node::Async {
            producer: Box::new(move |scope, restart| {
                let slot = ForwardCancel::new();
                scope.push(slot.finalizer_node());
                let callback = AsyncCallback::with_scope_pop(restart, scope.clone());
                let cancel = producer(callback);
                slot.fill(cancel.node);
            }),
            trampoline_after: true,
        })
    }

    /// An effect that never completes. Useful as a neutral element for
    /// [`crate::combinator::race`] and in tests.
    #[must_use]
    pub fn never() -> Self {
        Self::async_(|_cb| {})
    }

    /// Sequential composition: runs `self`, then the effect produced by `f`.
    #[must_use]
    pub fn flat_map<B, F>(self, f: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B> + Send + 'static,
    {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::bind(Box::new(move |value| f(unbox::<A>(value)).node)),
        ))
    }

    /// Applies a pure function to the produced value.
    #[must_use]
    pub fn map<B, F>(self, f: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_node(Node::Map(
            Box::new(self.node),
            Box::new(move |value| Box::new(f(unbox::<A>(value)))),
        ))
    }

    /// Discards the produced value.
    #[must_use]
    pub fn void(self) -> Effect<()> {
        self.map(|_| ())
    }

    /// Replaces `self`'s value with the next effect's value.
    #[must_use]
    pub fn and_then<B: Send + 'static>(self, next: Effect<B>) -> Effect<B> {
        self.flat_map(move |_| next)
    }

    /// Materializes the outcome: failures become `Err` values and no longer
    /// propagate. Fatal errors still bypass this.
    #[must_use]
    pub fn attempt(self) -> Effect<Result<A>> {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::handler(
                Some(Box::new(|value| {
                    Node::Pure(Box::new(Ok::<A, Error>(unbox::<A>(value))))
                })),
                Box::new(|error| Node::Pure(Box::new(Err::<A, Error>(error)))),
            ),
        ))
    }

    /// Recovers from a failure with a new effect. Successful values pass
    /// through untouched.
    #[must_use]
    pub fn handle_error_with<F>(self, f: F) -> Effect<A>
    where
        F: FnOnce(Error) -> Effect<A> + Send + 'static,
    {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::handler(None, Box::new(move |error| f(error).node)),
        ))
    }

    /// Folds both outcomes with pure functions.
    #[must_use]
    pub fn redeem<B, FE, FA>(self, recover: FE, map: FA) -> Effect<B>
    where
        B: Send + 'static,
        FE: FnOnce(Error) -> B + Send + 'static,
        FA: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::handler(
                Some(Box::new(move |value| {
                    Node::Pure(Box::new(map(unbox::<A>(value))))
                })),
                Box::new(move |error| Node::Pure(Box::new(recover(error)))),
            ),
        ))
    }

    /// Folds both outcomes with effectful continuations.
    #[must_use]
    pub fn redeem_with<B, FE, FA>(self, recover: FE, bind: FA) -> Effect<B>
    where
        B: Send + 'static,
        FE: FnOnce(Error) -> Effect<B> + Send + 'static,
        FA: FnOnce(A) -> Effect<B> + Send + 'static,
    {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::handler(
                Some(Box::new(move |value| bind(unbox::<A>(value)).node)),
                Box::new(move |error| recover(error).node),
            ),
        ))
    }

    /// Runs `fin` after `self` on every outcome path (success, failure,
    /// cancellation), exactly once.
    ///
    /// On a success path a finalizer failure surfaces; on a failure path the
    /// original error wins and the finalizer failure goes to the diagnostic
    /// channel.
    #[must_use]
    pub fn guarantee(self, fin: Effect<()>) -> Effect<A> {
        let shared = SharedFinalizer::new(fin);
        let cancel_side = shared.to_effect();
        let ok_side = shared.clone();
        let err_side = shared;
        // The restore frame swaps the scope's registration for a mask: from
        // here until the finalizer has run, a pending cancel cannot stop the
        // loop between the unregistration and the finalizer.
        Effect::<A>::from_node(Node::ContextSwitch {
            next: Box::new(self.node),
            modify: Box::new(move |scope| {
                scope.push(cancel_side.node);
                scope.clone()
            }),
            restore: Some(Arc::new(|_old, current| {
                let _ = current.pop();
                current.push_mask();
                current.clone()
            })),
        })
        .redeem_with(
            move |error| {
                err_side.to_effect().attempt().flat_map(move |fin_outcome| {
                    if let Err(fin_error) = fin_outcome {
                        diagnostic::report_finalizer_error(&fin_error);
                    }
                    pop_mask_effect().and_then(Effect::raise_error(error))
                })
            },
            move |value| {
                ok_side.to_effect().attempt().flat_map(move |fin_outcome| {
                    pop_mask_effect().and_then(Effect::from_result(fin_outcome.map(move |()| value)))
                })
            },
        )
    }

    /// Registers a finalizer that runs only if the interpretation is
    /// cancelled while `self` is in flight.
    #[must_use]
    pub fn on_cancel(self, fin: Effect<()>) -> Effect<A> {
        Effect::from_node(Node::ContextSwitch {
            next: Box::new(self.node),
            modify: Box::new(move |scope| {
                scope.push(fin.node);
                scope.clone()
            }),
            restore: Some(Arc::new(|_old, current| {
                let _ = current.pop();
                current.clone()
            })),
        })
    }

    /// Masks cancellation for the duration of `self`. A pending cancel is
    /// latched and observed at the first poll after the mask is lifted.
    #[must_use]
    pub fn uncancelable(self) -> Effect<A> {
        Effect::from_node(Node::ContextSwitch {
            next: Box::new(self.node),
            modify: Box::new(|scope| {
                scope.push_mask();
                scope.clone()
            }),
            restore: Some(Arc::new(|_old, current| {
                current.pop_mask();
                current.clone()
            })),
        })
    }

    /// Acquire/use/release with a release guarantee.
    ///
    /// `release` runs exactly once if `acquire` succeeded, on every outcome
    /// of `use_fn` (success, failure, cancellation), and not at all if
    /// `acquire` failed. `acquire` itself runs masked.
    ///
    /// The cancellation finalizer is registered before `acquire` starts and
    /// gated on a shared state cell, so a cancel landing at any point of the
    /// acquisition cannot leak the resource: either the finalizer finds the
    /// acquired resource and releases it, or the acquisition path notices
    /// the finalizer already ran and releases inline (and goes quiet instead
    /// of entering `use_fn`).
    ///
    /// The resource is needed on both the use and the release path, so it
    /// must be `Clone` (cheap handles in practice).
    #[must_use]
    pub fn bracket<B, U, R>(acquire: Effect<A>, use_fn: U, release: R) -> Effect<B>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> Effect<B> + Send + 'static,
        R: FnOnce(A) -> Effect<()> + Send + 'static,
    {
        let gate = Arc::new(BracketGate {
            state: StdMutex::new(GateState::<A>::Pending),
            release: StdMutex::new(Some(release)),
        });

        let fin = {
            let gate = Arc::clone(&gate);
            Effect::suspend(move || {
                let state = {
                    let mut state = gate.state.lock().expect("bracket gate poisoned");
                    std::mem::replace(&mut *state, GateState::Finalized)
                };
                match state {
                    GateState::Acquired(resource) => match gate.take_release() {
                        Some(release) => release(resource),
                        None => Effect::unit(),
                    },
                    GateState::Pending | GateState::Finalized => Effect::unit(),
                }
            })
        };
        let shared = SharedFinalizer::new(fin);
        let cancel_side = shared.to_effect();
        let ok_side = shared.clone();
        let err_side = shared;

        let store_gate = Arc::clone(&gate);
        let guarded = acquire
            .map(move |resource| {
                let mut state = store_gate.state.lock().expect("bracket gate poisoned");
                let finalized = matches!(&*state, GateState::Finalized);
                if !finalized {
                    *state = GateState::Acquired(resource.clone());
                }
                (resource, finalized)
            })
            .uncancelable();

        Effect::<B>::from_node(Node::ContextSwitch {
            next: Box::new(
                guarded
                    .flat_map(move |(resource, finalized)| {
                        if finalized {
                            // A cancel won while acquiring: release here and
                            // go quiet instead of entering use.
                            match gate.take_release() {
                                Some(release) => release(resource)
                                    .uncancelable()
                                    .flat_map(|()| Effect::never()),
                                None => Effect::never(),
                            }
                        } else {
                            use_fn(resource)
                        }
                    })
                    .node,
            ),
            modify: Box::new(move |scope| {
                scope.push(cancel_side.node);
                scope.clone()
            }),
            restore: Some(Arc::new(|_old, current| {
                let _ = current.pop();
                current.push_mask();
                current.clone()
            })),
        })
        .redeem_with(
            move |error| {
                err_side.to_effect().attempt().flat_map(move |fin_outcome| {
                    if let Err(fin_error) = fin_outcome {
                        diagnostic::report_finalizer_error(&fin_error);
                    }
                    pop_mask_effect().and_then(Effect::raise_error(error))
                })
            },
            move |value| {
                ok_side.to_effect().attempt().flat_map(move |fin_outcome| {
                    pop_mask_effect().and_then(Effect::from_result(fin_outcome.map(move |()| value)))
                })
            },
        )
    }

    /// Interprets the effect on the current thread, without support for
    /// asynchronous boundaries.
    ///
    /// # Errors
    ///
    /// Returns the effect's own failure, or [`ErrorKind::IllegalState`] if
    /// an `Async` node is reached.
    pub fn run_sync(self) -> Result<A> {
        run_loop::run_sync(self.node).map(unbox::<A>)
    }

    /// Interprets the effect, delivering the outcome to `callback`.
    ///
    /// Interpretation begins on the current thread and hops threads only at
    /// asynchronous boundaries. If the run is cancelled, the callback is
    /// never invoked.
    pub fn run_async(self, callback: impl FnOnce(Result<A>) + Send + 'static) {
        run_loop::run(
            self.node,
            CancelScope::new(),
            Box::new(move |outcome| callback(outcome.map(unbox::<A>))),
        );
    }

    /// Like [`Effect::run_async`], returning an effect that cancels the run.
    ///
    /// The returned effect completes only after the run's finalizers have
    /// finished.
    #[must_use = "dropping the cancel effect makes the run uncancellable"]
    pub fn run_cancellable(self, callback: impl FnOnce(Result<A>) + Send + 'static) -> Effect<()> {
        let scope = CancelScope::new();
        run_loop::run(
            self.node,
            scope.clone(),
            Box::new(move |outcome| callback(outcome.map(unbox::<A>))),
        );
        scope.cancel()
    }
}

impl Effect<()> {
    /// The unit effect.
    #[must_use]
    pub fn unit() -> Self {
        Self::pure(())
    }

    /// Re-submits the continuation to the worker pool, yielding the current
    /// thread. Subsequent steps run on a pool worker.
    #[must_use]
    pub fn shift() -> Self {
        Self::async_(|cb| {
            if let Err(e) = pool::default_pool().submit(Box::new(move || cb.complete(Ok(())))) {
                debug!(error = %e, "shift submission rejected");
            }
        })
    }
}

/// The completion callback handed to asynchronous producers.
///
/// Cloneable so producers can stash it in registries or move it across
/// threads; the at-most-once discipline is enforced internally. The first
/// completion wins, later ones are dropped.
pub struct AsyncCallback<A> {
    restart: Arc<RestartCallback>,
    pop_scope: Option<CancelScope>,
    popped: Arc<AtomicBool>,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for AsyncCallback<A> {
    fn clone(&self) -> Self {
        Self {
            restart: Arc::clone(&self.restart),
            pop_scope: self.pop_scope.clone(),
            popped: Arc::clone(&self.popped),
            _marker: PhantomData,
        }
    }
}

impl<A: Send + 'static> AsyncCallback<A> {
    pub(crate) fn new(restart: Arc<RestartCallback>) -> Self {
        Self {
            restart,
            pop_scope: None,
            popped: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        }
    }

    /// Callback for cancellable boundaries: completion unregisters the
    /// cancellation finalizer before resuming the loop.
    pub(crate) fn with_scope_pop(restart: Arc<RestartCallback>, scope: CancelScope) -> Self {
        Self {
            restart,
            pop_scope: Some(scope),
            popped: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        }
    }

    /// Delivers the outcome of the asynchronous operation.
    pub fn complete(&self, result: Result<A>) {
        if let Some(scope) = &self.pop_scope {
            if !self.popped.swap(true, Ordering::AcqRel) {
                let _ = scope.pop();
            }
        }
        self.restart
            .complete(result.map(|a| Box::new(a) as AnyValue));
    }
}
