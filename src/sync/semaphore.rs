//! Effect-level counting semaphore with fair FIFO queueing.
//!
//! Permits limit how many interpretations proceed concurrently; waiters
//! park on a per-slot [`Deferred`] and are granted strictly in arrival
//! order. The bounded concurrent traversal operator builds its permit
//! discipline on this.
//!
//! # Cancel Safety
//!
//! A cancelled `acquire` removes its queue entry; if the permit had already
//! been handed over in the meantime, the cancellation returns it, so no
//! permit is ever lost.

use crate::effect::{AsyncCallback, Effect};
use crate::sync::deferred::Deferred;
use crate::tracing_compat::trace;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

struct Waiter {
    id: u64,
    slot: Deferred<()>,
}

struct SemaphoreState {
    /// Number of available permits.
    permits: usize,
    /// Queue of waiters, granted front-first.
    waiters: VecDeque<Waiter>,
    /// Next waiter id for targeted removal.
    next_waiter_id: u64,
}

/// A counting semaphore over effects.
pub struct Semaphore {
    state: Arc<StdMutex<SemaphoreState>>,
}

impl Clone for Semaphore {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl Semaphore {
    /// Creates a semaphore with the given number of permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new(StdMutex::new(SemaphoreState {
                permits,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
        }
    }

    /// Returns the number of currently available permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.lock().permits
    }

    /// Returns the number of queued waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// An effect acquiring one permit, suspending while none is available.
    #[must_use]
    pub fn acquire(&self) -> Effect<()> {
        let semaphore = self.clone();
        Effect::suspend(move || {
            let slot = {
                let mut state = semaphore.lock();
                if state.permits > 0 {
                    state.permits -= 1;
                    return Effect::unit();
                }
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                let slot = Deferred::new();
                state.waiters.push_back(Waiter {
                    id,
                    slot: slot.clone(),
                });
                trace!(waiter_id = id, "semaphore acquire queued");
                (id, slot)
            };
            let (id, slot) = slot;
            Effect::cancellable(move |cb: AsyncCallback<()>| {
                slot.subscribe(move |()| cb.complete(Ok(())));
                let semaphore = semaphore.clone();
                Effect::delay(move || semaphore.cancel_waiter(id))
            })
        })
    }

    /// An effect releasing one permit, granting it to the oldest waiter if
    /// any.
    #[must_use]
    pub fn release(&self) -> Effect<()> {
        let semaphore = self.clone();
        Effect::delay(move || semaphore.release_now())
    }

    /// Runs `effect` holding one permit, releasing it on every outcome path.
    #[must_use]
    pub fn with_permit<A: Send + 'static>(&self, effect: Effect<A>) -> Effect<A> {
        let releaser = self.clone();
        Effect::bracket(
            self.acquire(),
            move |()| effect,
            move |()| releaser.release(),
        )
    }

    fn release_now(&self) {
        let granted = {
            let mut state = self.lock();
            match state.waiters.pop_front() {
                Some(waiter) => Some(waiter),
                None => {
                    state.permits += 1;
                    None
                }
            }
        };
        if let Some(waiter) = granted {
            trace!(waiter_id = waiter.id, "semaphore permit handed over");
            let _ = waiter.slot.complete_now(());
        }
    }

    /// Removes a cancelled waiter; if the permit was already handed over,
    /// passes it on instead.
    fn cancel_waiter(&self, id: u64) {
        let still_queued = {
            let mut state = self.lock();
            let before = state.waiters.len();
            state.waiters.retain(|waiter| waiter.id != id);
            state.waiters.len() != before
        };
        if !still_queued {
            self.release_now();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SemaphoreState> {
        self.state.lock().expect("semaphore state poisoned")
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Semaphore")
            .field("permits", &state.permits)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fast_path_decrements_permits() {
        let sem = Semaphore::new(2);
        sem.acquire().run_sync().expect("acquire");
        assert_eq!(sem.available_permits(), 1);
        sem.acquire().run_sync().expect("acquire");
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn release_restores_permit() {
        let sem = Semaphore::new(1);
        sem.acquire().run_sync().expect("acquire");
        sem.release().run_sync().expect("release");
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn exhausted_semaphore_queues_waiters_fifo() {
        let sem = Semaphore::new(1);
        sem.acquire().run_sync().expect("acquire");

        let (tx, rx) = mpsc::channel();
        for tag in ["first", "second"] {
            let tx = tx.clone();
            sem.acquire().run_async(move |outcome| {
                outcome.expect("acquire");
                tx.send(tag).expect("send");
            });
        }
        assert_eq!(sem.waiter_count(), 2);
        assert!(rx.try_recv().is_err());

        sem.release().run_sync().expect("release");
        assert_eq!(rx.recv().expect("recv"), "first");
        assert!(rx.try_recv().is_err());

        sem.release().run_sync().expect("release");
        assert_eq!(rx.recv().expect("recv"), "second");
    }

    #[test]
    fn cancelled_waiter_leaves_queue() {
        let sem = Semaphore::new(1);
        sem.acquire().run_sync().expect("acquire");

        let (tx, rx) = mpsc::channel();
        let cancel = sem.acquire().run_cancellable(move |outcome| {
            tx.send(outcome).expect("send");
        });
        assert_eq!(sem.waiter_count(), 1);

        cancel.run_sync().expect("cancel");
        assert_eq!(sem.waiter_count(), 0);
        assert!(rx.try_recv().is_err());

        // The held permit is unaffected.
        sem.release().run_sync().expect("release");
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn with_permit_releases_on_failure() {
        let sem = Semaphore::new(1);
        let failing: Effect<u8> = Effect::raise_error(crate::error::Error::user("task failed"));
        let outcome = sem.with_permit(failing).run_sync();
        assert!(outcome.is_err());
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn with_permit_releases_on_success() {
        let sem = Semaphore::new(1);
        let value = sem.with_permit(Effect::pure(11)).run_sync().expect("run");
        assert_eq!(value, 11);
        assert_eq!(sem.available_permits(), 1);
    }
}
