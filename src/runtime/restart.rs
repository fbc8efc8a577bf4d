//! Resumption after asynchronous boundaries.
//!
//! When the run loop reaches an `Async` node it parks its continuation state
//! in a [`RestartCallback`] and returns to the caller. The producer fires
//! the callback once with the outcome; the callback re-enters the loop with
//! the saved state. The same object is re-armed at every boundary of a run,
//! so one allocation serves the whole interpretation.
//!
//! # At-most-once
//!
//! A producer that invokes its callback twice has the second invocation
//! dropped; if the dropped result was an error a diagnostic line is emitted.
//! Frame-holding fields are cleared before resumption so continuations do
//! not linger through reference cycles with user closures.

use crate::cancel::CancelScope;
use crate::effect::{AnyValue, Node};
use crate::error::Result;
use crate::runtime::context::RunContext;
use crate::runtime::diagnostic;
use crate::runtime::frame::{CallStack, Frame};
use crate::runtime::run_loop::{self, TerminalCallback};
use crate::runtime::trampoline;
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use std::sync::Arc;

/// One-shot-per-boundary resumption object.
pub(crate) struct RestartCallback {
    state: Mutex<RestartState>,
}

struct RestartState {
    can_call: bool,
    scope: Option<CancelScope>,
    cb: Option<TerminalCallback>,
    b_first: Option<Frame>,
    b_rest: CallStack,
    ctx: Option<RunContext>,
    trampoline_after: bool,
}

impl RestartCallback {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RestartState {
                can_call: false,
                scope: None,
                cb: None,
                b_first: None,
                b_rest: CallStack::new(),
                ctx: None,
                trampoline_after: false,
            }),
        }
    }

    /// Arms the callback for one boundary, parking the loop state.
    pub(crate) fn prepare(
        &self,
        scope: CancelScope,
        cb: TerminalCallback,
        b_first: Option<Frame>,
        b_rest: CallStack,
        ctx: Option<RunContext>,
        trampoline_after: bool,
    ) {
        let mut state = self.state.lock();
        debug_assert!(!state.can_call, "restart callback armed twice");
        state.can_call = true;
        state.scope = Some(scope);
        state.cb = Some(cb);
        state.b_first = b_first;
        state.b_rest = b_rest;
        state.ctx = ctx;
        state.trampoline_after = trampoline_after;
    }

    /// Points the parked state at a different cancellation scope.
    pub(crate) fn set_scope(&self, scope: CancelScope) {
        self.state.lock().scope = Some(scope);
    }

    /// Delivers the boundary's outcome and resumes the loop.
    pub(crate) fn complete(self: &Arc<Self>, result: Result<AnyValue>) {
        let mut state = self.state.lock();
        if !state.can_call {
            drop(state);
            if let Err(error) = result {
                diagnostic::report_dropped_callback(&error);
            }
            return;
        }
        state.can_call = false;
        let scope = state
            .scope
            .take()
            .expect("restart callback armed without a scope");
        let cb = state
            .cb
            .take()
            .expect("restart callback armed without a terminal callback");
        let b_first = state.b_first.take();
        let b_rest = std::mem::take(&mut state.b_rest);
        let ctx = state.ctx.take();
        let trampoline_after = state.trampoline_after;
        drop(state);

        let this = Arc::clone(self);
        if trampoline_after {
            trampoline::execute(move || signal(this, result, scope, cb, b_first, b_rest, ctx));
        } else {
            signal(this, result, scope, cb, b_first, b_rest, ctx);
        }
    }
}

fn signal(
    this: Arc<RestartCallback>,
    result: Result<AnyValue>,
    scope: CancelScope,
    cb: TerminalCallback,
    b_first: Option<Frame>,
    b_rest: CallStack,
    ctx: Option<RunContext>,
) {
    if scope.is_cancelled() {
        trace!("resumption suppressed: scope cancelled while suspended");
        return;
    }
    let node = match result {
        Ok(value) => Node::Pure(value),
        Err(error) => Node::RaiseError(error),
    };
    run_loop::run_with_state(node, scope, cb, Some(this), b_first, b_rest, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn armed(
        outcomes: &Arc<StdMutex<Vec<Result<u32>>>>,
    ) -> Arc<RestartCallback> {
        let rcb = Arc::new(RestartCallback::new());
        let sink = Arc::clone(outcomes);
        rcb.prepare(
            CancelScope::new(),
            Box::new(move |r| {
                sink.lock()
                    .expect("outcomes poisoned")
                    .push(r.map(crate::effect::unbox::<u32>));
            }),
            None,
            CallStack::new(),
            None,
            false,
        );
        rcb
    }

    #[test]
    fn first_completion_wins() {
        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        let rcb = armed(&outcomes);
        rcb.complete(Ok(Box::new(1_u32)));
        rcb.complete(Ok(Box::new(2_u32)));

        let seen = outcomes.lock().expect("outcomes poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(*seen[0].as_ref().expect("first outcome"), 1);
    }

    #[test]
    fn dropped_error_goes_to_diagnostics() {
        let _guard = diagnostic::test_sink_lock();
        let lines = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&lines);
        diagnostic::set_sink(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        let rcb = armed(&outcomes);
        rcb.complete(Ok(Box::new(1_u32)));
        rcb.complete(Err(Error::user("too late")));
        diagnostic::clear_sink();

        assert_eq!(lines.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.lock().expect("outcomes poisoned").len(), 1);
    }

    #[test]
    fn cancelled_scope_suppresses_resumption() {
        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        let rcb = Arc::new(RestartCallback::new());
        let scope = CancelScope::new();
        let sink = Arc::clone(&outcomes);
        rcb.prepare(
            scope.clone(),
            Box::new(move |r| {
                sink.lock()
                    .expect("outcomes poisoned")
                    .push(r.map(crate::effect::unbox::<u32>));
            }),
            None,
            CallStack::new(),
            None,
            false,
        );
        scope.cancel().run_sync().expect("cancel effect");
        rcb.complete(Ok(Box::new(5_u32)));

        assert!(outcomes.lock().expect("outcomes poisoned").is_empty());
    }
}
