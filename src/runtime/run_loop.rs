//! The trampolined effect interpreter.
//!
//! One invocation owns its node register, continuation stack, and unboxed
//! value register exclusively; only the cancellation scope is shared. The
//! loop never grows the native stack: nesting lives in the heap-backed
//! [`CallStack`], and asynchronous boundaries park the state in a
//! [`RestartCallback`] and return.
//!
//! # Dispatch
//!
//! Per iteration the loop polls for cancellation (batched), then dispatches
//! on the current node:
//!
//! - `Pure`/`Delay` produce a value held in a register without allocating a
//!   node (the unboxed fast path).
//! - `Bind`/`Map` park their continuation (one hot slot plus overflow) and
//!   descend.
//! - `RaiseError` discards frames down to the nearest handler; fatal errors
//!   skip handlers entirely.
//! - `Async` arms the restart callback, hands it to the producer, returns.
//! - `ContextSwitch` rewrites the active scope and, if a restore is present,
//!   installs it as a handler frame covering both outcome paths.
//!
//! Panics in thunks and continuations are caught at each step and converted
//! to `RaiseError` nodes in place.

use crate::cancel::CancelScope;
use crate::effect::{AnyValue, Node};
use crate::error::{Error, Result};
use crate::runtime::context::RunContext;
use crate::runtime::diagnostic;
use crate::runtime::frame::{CallStack, Frame};
use crate::runtime::restart::RestartCallback;
use crate::tracing_compat::trace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// The terminal callback of one interpretation.
pub(crate) type TerminalCallback = Box<dyn FnOnce(Result<AnyValue>) + Send>;

/// Synchronous steps between cancellation polls. Bounds cancellation
/// latency without paying a per-step cost.
pub(crate) const AUTO_CANCEL_BATCH: u32 = 512;

/// Interprets a node from a cold start.
pub(crate) fn run(node: Node, scope: CancelScope, cb: TerminalCallback) {
    run_with_state(node, scope, cb, None, None, CallStack::new(), None);
}

/// Interprets a node, restoring parked state after an asynchronous boundary.
pub(crate) fn run_with_state(
    mut current: Node,
    mut scope: CancelScope,
    cb: TerminalCallback,
    mut restart: Option<Arc<RestartCallback>>,
    mut b_first: Option<Frame>,
    mut b_rest: CallStack,
    mut ctx: Option<RunContext>,
) {
    let mut cb = Some(cb);
    let mut iters: u32 = 0;

    loop {
        iters = iters.wrapping_add(1);
        if iters % AUTO_CANCEL_BATCH == 0 && scope.is_cancelled() {
            trace!(iters, "interpretation stopped at cancellation poll");
            return;
        }

        let value: AnyValue = match current {
            Node::Pure(value) => value,

            Node::Delay(thunk) => match catching(thunk) {
                Ok(value) => value,
                Err(error) => {
                    current = Node::RaiseError(error);
                    continue;
                }
            },

            Node::Suspend(thunk) => {
                current = match catching(thunk) {
                    Ok(node) => node,
                    Err(error) => Node::RaiseError(error),
                };
                continue;
            }

            Node::Bind(inner, frame) => {
                if let Some(prev) = b_first.take() {
                    b_rest.push(prev);
                }
                b_first = Some(frame);
                current = *inner;
                continue;
            }

            Node::Map(inner, f) => {
                if let Some(prev) = b_first.take() {
                    b_rest.push(prev);
                }
                b_first = Some(Frame::map(f));
                current = *inner;
                continue;
            }

            Node::RaiseError(error) => {
                if error.is_fatal() {
                    if let Some(ctx) = ctx.take() {
                        ctx.report_failure(&error);
                    }
                    let cb = cb.take().expect("terminal callback already consumed");
                    cb(Err(error));
                    return;
                }
                match find_error_handler(&mut b_first, &mut b_rest) {
                    Some(handler) => {
                        current = apply_error(handler, error);
                        continue;
                    }
                    None => {
                        if let Some(ctx) = ctx.take() {
                            ctx.report_failure(&error);
                        }
                        let cb = cb.take().expect("terminal callback already consumed");
                        cb(Err(error));
                        return;
                    }
                }
            }

            Node::Async {
                producer,
                trampoline_after,
            } => {
                ctx.get_or_insert_with(RunContext::new).record_boundary();
                let rcb = restart
                    .take()
                    .unwrap_or_else(|| Arc::new(RestartCallback::new()));
                let cb = cb.take().expect("terminal callback already consumed");
                rcb.prepare(
                    scope.clone(),
                    cb,
                    b_first.take(),
                    std::mem::take(&mut b_rest),
                    ctx.take(),
                    trampoline_after,
                );
                producer(&scope, Arc::clone(&rcb));
                return;
            }

            Node::ContextSwitch {
                next,
                modify,
                restore,
            } => {
                let new_scope = modify(&scope);
                if !CancelScope::same(&new_scope, &scope) {
                    if let Some(rcb) = restart.as_ref() {
                        rcb.set_scope(new_scope.clone());
                    }
                }
                if let Some(restore) = restore {
                    let frame = restore_frame(restore, scope.clone());
                    if let Some(prev) = b_first.take() {
                        b_rest.push(prev);
                    }
                    b_first = Some(frame);
                }
                scope = new_scope;
                current = *next;
                continue;
            }
        };

        // Unboxed fast path: a value is in hand, feed the next consuming frame.
        match next_success_frame(&mut b_first, &mut b_rest) {
            Some(frame) => current = apply_value(frame, value),
            None => {
                drop(ctx.take());
                let cb = cb.take().expect("terminal callback already consumed");
                cb(Ok(value));
                return;
            }
        }
    }
}

/// Interprets a node synchronously on the current thread.
///
/// Asynchronous boundaries are illegal here; reaching one fails the run.
pub(crate) fn run_sync(mut current: Node) -> Result<AnyValue> {
    let mut scope = CancelScope::new();
    let mut b_first: Option<Frame> = None;
    let mut b_rest = CallStack::new();

    loop {
        let value: AnyValue = match current {
            Node::Pure(value) => value,

            Node::Delay(thunk) => match catching(thunk) {
                Ok(value) => value,
                Err(error) => {
                    current = Node::RaiseError(error);
                    continue;
                }
            },

            Node::Suspend(thunk) => {
                current = match catching(thunk) {
                    Ok(node) => node,
                    Err(error) => Node::RaiseError(error),
                };
                continue;
            }

            Node::Bind(inner, frame) => {
                if let Some(prev) = b_first.take() {
                    b_rest.push(prev);
                }
                b_first = Some(frame);
                current = *inner;
                continue;
            }

            Node::Map(inner, f) => {
                if let Some(prev) = b_first.take() {
                    b_rest.push(prev);
                }
                b_first = Some(Frame::map(f));
                current = *inner;
                continue;
            }

            Node::RaiseError(error) => {
                if error.is_fatal() {
                    return Err(error);
                }
                match find_error_handler(&mut b_first, &mut b_rest) {
                    Some(handler) => {
                        current = apply_error(handler, error);
                        continue;
                    }
                    None => return Err(error),
                }
            }

            Node::Async { .. } => {
                return Err(Error::illegal_state(
                    "run_sync reached an asynchronous boundary",
                ));
            }

            Node::ContextSwitch {
                next,
                modify,
                restore,
            } => {
                let new_scope = modify(&scope);
                if let Some(restore) = restore {
                    let frame = restore_frame(restore, scope.clone());
                    if let Some(prev) = b_first.take() {
                        b_rest.push(prev);
                    }
                    b_first = Some(frame);
                }
                scope = new_scope;
                current = *next;
                continue;
            }
        };

        match next_success_frame(&mut b_first, &mut b_rest) {
            Some(frame) => current = apply_value(frame, value),
            None => return Ok(value),
        }
    }
}

/// Interprets a node with nobody waiting on the outcome. Failures go to the
/// diagnostic channel.
pub(crate) fn run_detached(node: Node) {
    crate::runtime::trampoline::execute(move || {
        run(
            node,
            CancelScope::new(),
            Box::new(|outcome| {
                if let Err(error) = outcome {
                    diagnostic::report_detached_error(&error);
                }
            }),
        );
    });
}

/// Evaluates a closure, converting a panic into an error.
fn catching<T>(f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(Error::from_panic)
}

/// Builds the handler frame that re-applies `restore` on whichever outcome
/// path fires. The frame re-enters the loop through a fresh `ContextSwitch`
/// so the scope register is rewritten in loop position, not from inside a
/// continuation.
fn restore_frame(
    restore: crate::effect::RestoreFn,
    old: CancelScope,
) -> Frame {
    let ok_restore = Arc::clone(&restore);
    let ok_old = old.clone();
    Frame::handler(
        Some(Box::new(move |value| Node::ContextSwitch {
            next: Box::new(Node::Pure(value)),
            modify: Box::new(move |current| ok_restore(&ok_old, current)),
            restore: None,
        })),
        Box::new(move |error| Node::ContextSwitch {
            next: Box::new(Node::RaiseError(error)),
            modify: Box::new(move |current| restore(&old, current)),
            restore: None,
        }),
    )
}

/// Discards frames down to the nearest error handler.
fn find_error_handler(b_first: &mut Option<Frame>, b_rest: &mut CallStack) -> Option<Frame> {
    if let Some(frame) = b_first.take() {
        if frame.is_handler() {
            return Some(frame);
        }
    }
    while let Some(frame) = b_rest.pop() {
        if frame.is_handler() {
            return Some(frame);
        }
    }
    None
}

/// Pops the next frame that consumes a value, skipping error-only handlers.
fn next_success_frame(b_first: &mut Option<Frame>, b_rest: &mut CallStack) -> Option<Frame> {
    loop {
        let frame = match b_first.take() {
            Some(frame) => frame,
            None => b_rest.pop()?,
        };
        if frame.has_success_arm() {
            return Some(frame);
        }
    }
}

/// Applies a value-consuming frame, converting a panic into a raise.
fn apply_value(frame: Frame, value: AnyValue) -> Node {
    let applied = match frame {
        Frame::Bind(f) => catching(move || f(value)),
        Frame::Map(f) => catching(move || Node::Pure(f(value))),
        Frame::Handler { ok: Some(f), .. } => catching(move || f(value)),
        Frame::Handler { ok: None, .. } => {
            unreachable!("error-only handler frame on the value path")
        }
    };
    match applied {
        Ok(node) => node,
        Err(error) => Node::RaiseError(error),
    }
}

/// Applies a handler's recovery arm, converting a panic into a re-raise.
fn apply_error(frame: Frame, error: Error) -> Node {
    match frame {
        Frame::Handler { err, .. } => match catching(move || err(error)) {
            Ok(node) => node,
            Err(panic_error) => Node::RaiseError(panic_error),
        },
        Frame::Bind(_) | Frame::Map(_) => {
            unreachable!("non-handler frame on the error path")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use std::sync::mpsc;

    #[test]
    fn cold_start_delivers_value() {
        let (tx, rx) = mpsc::channel();
        run(
            Effect::pure(3_u32).into_node(),
            CancelScope::new(),
            Box::new(move |r| {
                tx.send(r.map(crate::effect::unbox::<u32>)).expect("send");
            }),
        );
        assert_eq!(rx.recv().expect("recv").expect("value"), 3);
    }

    #[test]
    fn cancelled_scope_stops_at_poll_boundary() {
        let scope = CancelScope::new();
        scope.cancel().run_sync().expect("cancel");

        // A long pure chain crosses several poll boundaries; the terminal
        // callback must never fire.
        let mut effect = Effect::pure(0_u64);
        for _ in 0..(AUTO_CANCEL_BATCH * 4) {
            effect = effect.map(|n| n + 1);
        }
        let (tx, rx) = mpsc::channel();
        run(
            effect.into_node(),
            scope,
            Box::new(move |_| tx.send(()).expect("send")),
        );
        assert!(rx.try_recv().is_err(), "terminal callback fired after cancel");
    }

    #[test]
    fn deep_bind_chain_is_stack_safe() {
        let mut effect = Effect::pure(0_u64);
        for _ in 0..100_000 {
            effect = effect.flat_map(|n| Effect::pure(n + 1));
        }
        assert_eq!(effect.run_sync().expect("value"), 100_000);
    }

    #[test]
    fn error_discards_plain_frames() {
        let effect: Effect<u64> = Effect::raise_error(Error::user("boom"))
            .map(|n: u64| n + 1)
            .flat_map(|n| Effect::pure(n + 1));
        assert!(effect.run_sync().is_err());
    }

    #[test]
    fn nearest_handler_wins() {
        let effect: Effect<&str> = Effect::raise_error(Error::user("boom"))
            .handle_error_with(|_| Effect::pure("inner"))
            .handle_error_with(|_| Effect::pure("outer"));
        assert_eq!(effect.run_sync().expect("value"), "inner");
    }

    #[test]
    fn recovery_that_raises_reenters_raise_path() {
        let effect: Effect<u8> = Effect::raise_error(Error::user("first"))
            .handle_error_with(|_| Effect::raise_error(Error::user("second")))
            .handle_error_with(|e| {
                assert_eq!(e.to_string(), "User: second");
                Effect::pure(7)
            });
        assert_eq!(effect.run_sync().expect("value"), 7);
    }

    #[test]
    fn panicking_recovery_reenters_raise_path() {
        let effect: Effect<u8> = Effect::raise_error(Error::user("first"))
            .handle_error_with(|_| -> Effect<u8> { panic!("recovery exploded") })
            .handle_error_with(|e| {
                assert!(e.to_string().contains("recovery exploded"));
                Effect::pure(9)
            });
        assert_eq!(effect.run_sync().expect("value"), 9);
    }
}
