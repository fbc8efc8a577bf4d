//! Current-thread trampoline executor.
//!
//! The trampoline runs tasks on the calling thread without growing the
//! native stack: a task submitted while another trampolined task is running
//! is queued and drained by the outermost call. This breaks unbounded
//! recursion through callback chains (an async producer completing inline,
//! a `Deferred` firing its waiters, and so on).
//!
//! Process-wide but stateless: all state is a thread-local re-entry depth
//! and queue.

use std::cell::RefCell;
use std::collections::VecDeque;

thread_local! {
    static STATE: RefCell<TrampolineState> = RefCell::new(TrampolineState {
        depth: 0,
        queue: VecDeque::new(),
    });
}

struct TrampolineState {
    depth: u32,
    queue: VecDeque<Box<dyn FnOnce()>>,
}

/// Resets the re-entry depth even if a task panics, so the thread's
/// trampoline is not wedged permanently.
struct DepthGuard;

impl Drop for DepthGuard {
    fn drop(&mut self) {
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            s.depth = 0;
            s.queue.clear();
        });
    }
}

/// Runs `task` on the current thread, queueing it if a trampolined task is
/// already running here.
///
/// The outermost call drains the queue before returning, so every queued
/// task runs exactly once, in submission order, with constant native-stack
/// depth.
pub fn execute<F: FnOnce() + 'static>(task: F) {
    let task: Box<dyn FnOnce()> = Box::new(task);
    let immediate = STATE.with(|s| {
        let mut s = s.borrow_mut();
        if s.depth > 0 {
            s.queue.push_back(task);
            None
        } else {
            s.depth = 1;
            Some(task)
        }
    });

    let Some(task) = immediate else { return };
    let guard = DepthGuard;
    task();
    loop {
        let next = STATE.with(|s| s.borrow_mut().queue.pop_front());
        match next {
            Some(queued) => queued(),
            None => break,
        }
    }
    drop(guard);
}
