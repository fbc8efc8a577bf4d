//! Single-assignment cell with suspended readers.
//!
//! A [`Deferred`] starts unset, accepts exactly one value, and delivers that
//! value to every reader exactly once. Readers that arrive early suspend
//! (semantically; no thread blocks) and are woken by completion. Waiter
//! registrations carry monotonically increasing ids so cancellation can
//! remove exactly its own registration, idempotently.
//!
//! # Completion
//!
//! `complete` hands each waiter to the trampoline rather than invoking it
//! inline, so a slow waiter cannot block the completer and completion order
//! does not imply callback order.

use crate::effect::{AsyncCallback, Effect};
use crate::error::Error;
use crate::runtime::trampoline;
use crate::tracing_compat::trace;
use std::sync::{Arc, Mutex as StdMutex};

type Waiter<T> = Box<dyn FnOnce(T) + Send>;

enum DeferredState<T> {
    /// Not yet completed; waiters keyed by registration id.
    Unset {
        waiters: Vec<(u64, Waiter<T>)>,
        next_id: u64,
    },
    /// Completed. Terminal: the cell never leaves this state.
    Set(T),
}

/// A single-assignment cell.
///
/// Handles are `Clone` and share the cell. The value type must be `Clone`
/// because every reader receives it.
pub struct Deferred<T> {
    inner: Arc<StdMutex<DeferredState<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    /// Creates an unset cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(DeferredState::Unset {
                waiters: Vec::new(),
                next_id: 0,
            })),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Returns the value if the cell is set.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        match &*self.lock() {
            DeferredState::Set(value) => Some(value.clone()),
            DeferredState::Unset { .. } => None,
        }
    }

    /// An effect producing the cell's value, suspending until completion.
    ///
    /// The read is cancellable: cancelling a suspended reader removes its
    /// waiter registration (idempotently) and nothing else.
    #[must_use]
    pub fn get(&self) -> Effect<T> {
        let cell = self.clone();
        Effect::suspend(move || {
            if let Some(value) = cell.try_get() {
                return Effect::pure(value);
            }
            Effect::cancellable(move |cb: AsyncCallback<T>| {
                let waiter_cb = cb.clone();
                match cell.register(move |value| waiter_cb.complete(Ok(value))) {
                    // Completed between the check and the registration;
                    // the callback already fired inline.
                    None => Effect::unit(),
                    Some(id) => {
                        let cell = cell.clone();
                        Effect::delay(move || cell.remove_waiter(id))
                    }
                }
            })
        })
    }

    /// Like [`Deferred::get`] but immune to cancellation: the registration
    /// cannot be removed, so the reader observes the value whenever it
    /// arrives.
    #[must_use]
    pub fn get_uninterruptible(&self) -> Effect<T> {
        let cell = self.clone();
        Effect::async_(move |cb: AsyncCallback<T>| {
            cell.subscribe(move |value| cb.complete(Ok(value)));
        })
    }

    /// An effect that completes the cell.
    ///
    /// Fails with [`crate::ErrorKind::IllegalState`] if the cell is already
    /// set; every waiter observes the first value exactly once.
    #[must_use]
    pub fn complete(&self, value: T) -> Effect<()> {
        let cell = self.clone();
        Effect::suspend(move || {
            if cell.complete_now(value) {
                Effect::unit()
            } else {
                Effect::raise_error(Error::illegal_state("deferred already completed"))
            }
        })
    }

    /// Completes the cell outside effect interpretation. Returns `false` if
    /// it was already set.
    pub(crate) fn complete_now(&self, value: T) -> bool {
        let mut state = self.lock();
        match &mut *state {
            DeferredState::Set(_) => false,
            DeferredState::Unset { .. } => {
                let previous = std::mem::replace(&mut *state, DeferredState::Set(value.clone()));
                drop(state);
                if let DeferredState::Unset { waiters, .. } = previous {
                    trace!(waiters = waiters.len(), "deferred completed");
                    for (_, waiter) in waiters {
                        let value = value.clone();
                        trampoline::execute(move || waiter(value));
                    }
                }
                true
            }
        }
    }

    /// Registers a non-removable waiter; fires inline if already set.
    pub(crate) fn subscribe(&self, f: impl FnOnce(T) + Send + 'static) {
        let _ = self.register_inner(Box::new(f));
    }

    /// Registers a removable waiter. Returns its id, or `None` if the cell
    /// was already set and the waiter fired inline.
    fn register(&self, f: impl FnOnce(T) + Send + 'static) -> Option<u64> {
        self.register_inner(Box::new(f))
    }

    fn register_inner(&self, f: Waiter<T>) -> Option<u64> {
        let mut state = self.lock();
        match &mut *state {
            DeferredState::Set(value) => {
                let value = value.clone();
                drop(state);
                f(value);
                None
            }
            DeferredState::Unset { waiters, next_id } => {
                let id = *next_id;
                *next_id += 1;
                waiters.push((id, f));
                Some(id)
            }
        }
    }

    /// Removes a waiter registration. Idempotent; a no-op once the cell is
    /// set.
    fn remove_waiter(&self, id: u64) {
        let mut state = self.lock();
        if let DeferredState::Unset { waiters, .. } = &mut *state {
            waiters.retain(|(waiter_id, _)| *waiter_id != id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeferredState<T>> {
        self.inner.lock().expect("deferred state poisoned")
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock().expect("deferred state poisoned");
        let (set, waiters) = match &*state {
            DeferredState::Set(_) => (true, 0),
            DeferredState::Unset { waiters, .. } => (false, waiters.len()),
        };
        f.debug_struct("Deferred")
            .field("set", &set)
            .field("waiters", &waiters)
            .finish()
    }
}

/// An effect allocating a fresh unset cell.
#[must_use]
pub fn deferred<T: Clone + Send + 'static>() -> Effect<Deferred<T>> {
    Effect::delay(Deferred::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::mpsc;

    #[test]
    fn try_get_reflects_state() {
        let cell: Deferred<u32> = Deferred::new();
        assert_eq!(cell.try_get(), None);
        assert!(cell.complete_now(4));
        assert_eq!(cell.try_get(), Some(4));
    }

    #[test]
    fn get_after_complete_is_synchronous() {
        let cell: Deferred<u32> = Deferred::new();
        cell.complete(9).run_sync().expect("complete");
        assert_eq!(cell.get().run_sync().expect("get"), 9);
    }

    #[test]
    fn second_complete_fails_with_illegal_state() {
        let cell: Deferred<u32> = Deferred::new();
        cell.complete(1).run_sync().expect("first complete");
        let err = cell.complete(2).run_sync().expect_err("second complete");
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(cell.try_get(), Some(1));
    }

    #[test]
    fn suspended_reader_is_woken() {
        let cell: Deferred<u32> = Deferred::new();
        let (tx, rx) = mpsc::channel();
        cell.get().run_async(move |outcome| {
            tx.send(outcome).expect("send");
        });
        assert!(rx.try_recv().is_err(), "reader completed before the cell");

        cell.complete(5).run_sync().expect("complete");
        assert_eq!(rx.recv().expect("recv").expect("value"), 5);
    }

    #[test]
    fn every_waiter_observes_the_value_once() {
        let cell: Deferred<u32> = Deferred::new();
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let tx = tx.clone();
            cell.get().run_async(move |outcome| {
                tx.send(outcome).expect("send");
            });
        }
        cell.complete(3).run_sync().expect("complete");

        for _ in 0..10 {
            assert_eq!(rx.recv().expect("recv").expect("value"), 3);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancelled_reader_is_removed() {
        let cell: Deferred<u32> = Deferred::new();
        let (tx, rx) = mpsc::channel();
        let cancel = cell.get().run_cancellable(move |outcome| {
            tx.send(outcome).expect("send");
        });
        cancel.run_sync().expect("cancel effect");

        // Completion after cancellation wakes nobody.
        cell.complete(8).run_sync().expect("complete");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn uninterruptible_reader_survives_cancel() {
        let cell: Deferred<u32> = Deferred::new();
        let (tx, rx) = mpsc::channel();
        let cancel = cell.get_uninterruptible().run_cancellable(move |outcome| {
            tx.send(outcome).expect("send");
        });
        cancel.run_sync().expect("cancel effect");

        cell.complete(6).run_sync().expect("complete");
        // The registration survived, but the run was cancelled, so the
        // terminal callback still must not fire.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_waiter_is_idempotent() {
        let cell: Deferred<u32> = Deferred::new();
        let id = cell.register(|_| {}).expect("registered");
        cell.remove_waiter(id);
        cell.remove_waiter(id);
        assert!(cell.complete_now(1));
    }
}
