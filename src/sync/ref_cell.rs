//! Mutable cell whose operations are effects.
//!
//! [`Ref`] wraps a value behind a shared handle; `get`/`set`/`update`/
//! `modify` are all descriptions evaluated inside `Delay`, so reading or
//! writing only happens under interpretation. Update functions must be
//! pure: they run under the cell's internal lock and must not interpret
//! effects themselves.

use crate::effect::Effect;
use std::sync::{Arc, Mutex as StdMutex};

/// A shared mutable cell.
pub struct Ref<A> {
    cell: Arc<StdMutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: Clone + Send + 'static> Ref<A> {
    /// Creates a cell holding `initial`.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self {
            cell: Arc::new(StdMutex::new(initial)),
        }
    }

    /// An effect allocating a fresh cell.
    #[must_use]
    pub fn of(initial: A) -> Effect<Self> {
        Effect::delay(move || Self::new(initial))
    }

    /// An effect reading the current value.
    #[must_use]
    pub fn get(&self) -> Effect<A> {
        let cell = self.clone();
        Effect::delay(move || cell.lock().clone())
    }

    /// An effect replacing the value.
    #[must_use]
    pub fn set(&self, value: A) -> Effect<()> {
        let cell = self.clone();
        Effect::delay(move || {
            *cell.lock() = value;
        })
    }

    /// An effect applying a pure transformation to the value.
    #[must_use]
    pub fn update(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<()> {
        let cell = self.clone();
        Effect::delay(move || {
            let mut guard = cell.lock();
            let current = guard.clone();
            *guard = f(current);
        })
    }

    /// An effect transforming the value and returning a derived result.
    #[must_use]
    pub fn modify<B, F>(&self, f: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> (A, B) + Send + 'static,
    {
        let cell = self.clone();
        Effect::delay(move || {
            let mut guard = cell.lock();
            let (next, derived) = f(guard.clone());
            *guard = next;
            derived
        })
    }

    /// An effect applying a transformation and returning the previous value.
    #[must_use]
    pub fn get_and_update(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<A> {
        self.modify(move |current| (f(current.clone()), current))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, A> {
        self.cell.lock().expect("ref cell poisoned")
    }
}

impl<A: std::fmt::Debug> std::fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref")
            .field("value", &*self.cell.lock().expect("ref cell poisoned"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_reads_initial_value() {
        let cell = Ref::new(10);
        assert_eq!(cell.get().run_sync().expect("get"), 10);
    }

    #[test]
    fn set_replaces_value() {
        let cell = Ref::new(1);
        cell.set(5).run_sync().expect("set");
        assert_eq!(cell.get().run_sync().expect("get"), 5);
    }

    #[test]
    fn update_applies_function() {
        let cell = Ref::new(2);
        cell.update(|n| n * 10).run_sync().expect("update");
        assert_eq!(cell.get().run_sync().expect("get"), 20);
    }

    #[test]
    fn modify_returns_derived_value() {
        let cell = Ref::new(3);
        let doubled = cell
            .modify(|n| (n + 1, n * 2))
            .run_sync()
            .expect("modify");
        assert_eq!(doubled, 6);
        assert_eq!(cell.get().run_sync().expect("get"), 4);
    }

    #[test]
    fn get_and_update_returns_previous() {
        let cell = Ref::new(7);
        let previous = cell
            .get_and_update(|n| n + 1)
            .run_sync()
            .expect("get_and_update");
        assert_eq!(previous, 7);
        assert_eq!(cell.get().run_sync().expect("get"), 8);
    }

    #[test]
    fn operations_are_lazy() {
        let cell = Ref::new(0);
        let _unused = cell.update(|n| n + 1);
        assert_eq!(cell.get().run_sync().expect("get"), 0);
    }

    #[test]
    fn handles_share_state() {
        let cell = Ref::new(0);
        let other = cell.clone();
        other.set(9).run_sync().expect("set");
        assert_eq!(cell.get().run_sync().expect("get"), 9);
    }
}
