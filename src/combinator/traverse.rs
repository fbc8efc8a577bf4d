//! Bounded concurrent traversal.
//!
//! [`parallel_traverse_n`] runs a family of effects as fibers with at most
//! `limit` of them past the permit gate at any moment. Results come back in
//! input order regardless of completion order. The first failure observed
//! cancels the remaining work and surfaces; sibling outcomes are discarded.
//! Cancelling the traversal cancels every in-flight fiber and releases the
//! waiters queued on the permit gate.

use crate::effect::Effect;
use crate::error::Error;
use crate::fiber::{self, Fiber};
use crate::sync::semaphore::Semaphore;
use crate::tracing_compat::trace;
use std::sync::{Arc, Mutex as StdMutex};

/// Maps `f` over `items`, interpreting the produced effects with
/// parallelism bounded by `limit`.
///
/// # Panics
///
/// Panics if `limit` is zero.
#[must_use]
pub fn parallel_traverse_n<A, B, F>(limit: usize, items: Vec<A>, f: F) -> Effect<Vec<B>>
where
    A: Send + 'static,
    B: Clone + Send + 'static,
    F: Fn(A) -> Effect<B> + Send + 'static,
{
    assert!(limit > 0, "parallelism limit must be at least 1");
    Effect::suspend(move || {
        let gate = Semaphore::new(limit);
        trace!(limit, items = items.len(), "bounded traversal starting");

        // Fibers register here as they start, so a cancel arriving at any
        // point of the traversal (even mid-start) reaches all of them.
        let registry: Arc<StdMutex<Vec<Fiber<B>>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut started = Effect::unit();
        for item in items {
            let task = gate.with_permit(f(item));
            let register = Arc::clone(&registry);
            started = started.flat_map(move |()| {
                fiber::start(task).map(move |fiber| {
                    register
                        .lock()
                        .expect("traversal registry poisoned")
                        .push(fiber);
                })
            });
        }

        let join_registry = Arc::clone(&registry);
        started
            .flat_map(move |()| {
                let fibers = Arc::new(
                    join_registry
                        .lock()
                        .expect("traversal registry poisoned")
                        .clone(),
                );
                join_in_order(fibers, 0, Vec::new())
            })
            .on_cancel(cancel_registry(registry))
    })
}

/// Interprets `effects` with parallelism bounded by `limit`, collecting the
/// values in input order.
#[must_use]
pub fn parallel_sequence_n<A>(limit: usize, effects: Vec<Effect<A>>) -> Effect<Vec<A>>
where
    A: Clone + Send + 'static,
{
    parallel_traverse_n(limit, effects, |effect| effect)
}

/// Interprets `count` effects built by `factory` with parallelism bounded
/// by `limit`.
///
/// Effects are single-run descriptions, so replication takes a factory
/// rather than a value.
#[must_use]
pub fn parallel_replicate_n<A, F>(limit: usize, count: usize, factory: F) -> Effect<Vec<A>>
where
    A: Clone + Send + 'static,
    F: Fn() -> Effect<A> + Send + 'static,
{
    parallel_traverse_n(limit, (0..count).collect(), move |_| factory())
}

/// Combines two effects evaluated in parallel as fibers.
///
/// The first failure cancels the other side and surfaces.
#[must_use]
pub fn par_map2<A, B, C, F>(left: Effect<A>, right: Effect<B>, f: F) -> Effect<C>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Send + 'static,
    F: FnOnce(A, B) -> C + Send + 'static,
{
    fiber::start(left).flat_map(move |left_fiber| {
        fiber::start(right).flat_map(move |right_fiber| {
            let right_on_failure = right_fiber.clone();
            left_fiber.join().attempt().flat_map(move |outcome| match outcome {
                Err(error) => right_on_failure
                    .cancel()
                    .and_then(Effect::raise_error(error)),
                Ok(a) => right_fiber.join().map(move |b| f(a, b)),
            })
        })
    })
}

fn join_in_order<B: Clone + Send + 'static>(
    fibers: Arc<Vec<Fiber<B>>>,
    index: usize,
    mut collected: Vec<B>,
) -> Effect<Vec<B>> {
    if index == fibers.len() {
        return Effect::pure(collected);
    }
    let fiber = fibers[index].clone();
    fiber.join().attempt().flat_map(move |outcome| match outcome {
        Ok(value) => {
            collected.push(value);
            Effect::suspend(move || join_in_order(fibers, index + 1, collected))
        }
        Err(error) => first_failure(fibers, error),
    })
}

fn first_failure<B: Clone + Send + 'static>(
    fibers: Arc<Vec<Fiber<B>>>,
    error: Error,
) -> Effect<Vec<B>> {
    trace!(error = %error, "traversal failing, cancelling siblings");
    cancel_all(fibers).and_then(Effect::raise_error(error))
}

fn cancel_all<B: Clone + Send + 'static>(fibers: Arc<Vec<Fiber<B>>>) -> Effect<()> {
    Effect::suspend(move || {
        let mut acc = Effect::unit();
        for fiber in fibers.iter() {
            acc = acc.and_then(fiber.cancel());
        }
        acc
    })
}

fn cancel_registry<B: Clone + Send + 'static>(
    registry: Arc<StdMutex<Vec<Fiber<B>>>>,
) -> Effect<()> {
    Effect::suspend(move || {
        let fibers = registry
            .lock()
            .expect("traversal registry poisoned")
            .clone();
        cancel_all(Arc::new(fibers))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::sync::ref_cell::Ref;
    use std::sync::mpsc;
    use std::time::Duration;

    fn block_on<A: Clone + Send + 'static>(effect: Effect<A>) -> Result<A> {
        let (tx, rx) = mpsc::channel();
        effect.run_async(move |outcome| {
            tx.send(outcome).expect("send");
        });
        rx.recv_timeout(Duration::from_secs(10))
            .expect("effect did not terminate")
    }

    #[test]
    fn preserves_input_order() {
        let values: Vec<u32> = (0..20).collect();
        let effect = parallel_traverse_n(4, values.clone(), |n| {
            // Later items finish sooner; order must still hold.
            Effect::delay(move || {
                std::thread::sleep(Duration::from_millis(u64::from(20 - n)));
                n
            })
        });
        assert_eq!(block_on(effect).expect("traverse"), values);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let effect = parallel_traverse_n(3, Vec::<u32>::new(), Effect::pure);
        assert_eq!(block_on(effect).expect("traverse"), Vec::<u32>::new());
    }

    #[test]
    fn sequence_collects_in_order() {
        let effects = (0..10).map(Effect::pure).collect();
        let effect = parallel_sequence_n(2, effects);
        assert_eq!(
            block_on(effect).expect("sequence"),
            (0..10).collect::<Vec<u32>>()
        );
    }

    #[test]
    fn replicate_runs_factory_count_times() {
        let counter = Ref::new(0_u32);
        let tally = counter.clone();
        let effect = parallel_replicate_n(2, 25, move || tally.update(|n| n + 1))
            .and_then(counter.get());
        assert_eq!(block_on(effect).expect("replicate"), 25);
    }

    #[test]
    fn first_failure_surfaces() {
        let effect = parallel_traverse_n(2, vec![1_u32, 2, 3], |n| {
            if n == 2 {
                Effect::raise_error(Error::user("item two failed"))
            } else {
                Effect::pure(n)
            }
        });
        let err = block_on(effect).expect_err("traverse must fail");
        assert_eq!(err.to_string(), "User: item two failed");
    }

    #[test]
    fn par_map2_combines() {
        let effect = par_map2(Effect::pure(20), Effect::delay(|| 22), |a, b| a + b);
        assert_eq!(block_on(effect).expect("par_map2"), 42);
    }

    #[test]
    fn par_map2_failure_cancels_other_side() {
        let failing: Effect<u8> = Effect::raise_error(Error::user("left failed"));
        let effect = par_map2(failing, Effect::<u8>::never(), |a, _| a);
        let err = block_on(effect).expect_err("must fail");
        assert_eq!(err.to_string(), "User: left failed");
    }
}
