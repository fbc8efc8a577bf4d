//! First-completion-wins combinators.
//!
//! Both racers run as independent fibers on the worker pool. The first
//! terminal outcome decides the race: a successful winner yields its value,
//! a failed winner fails the race and cancels the other side. [`race`]
//! cancels the loser; [`race_pair`] hands the loser's fiber back still
//! running.

use crate::cancel::CancelScope;
use crate::effect::{unbox, AsyncCallback, Effect};
use crate::error::Result;
use crate::fiber::Fiber;
use crate::runtime::pool::{self, Executor};
use crate::runtime::run_loop;
use crate::sync::deferred::Deferred;
use crate::tracing_compat::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A value from one of two sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<A, B> {
    /// The left source produced the value.
    Left(A),
    /// The right source produced the value.
    Right(B),
}

/// Outcome of [`race_pair`]: the winner's value plus the loser's still
/// running fiber.
pub enum RacePair<A, B> {
    /// The left effect finished first.
    LeftWon(A, Fiber<B>),
    /// The right effect finished first.
    RightWon(Fiber<A>, B),
}

impl<A: std::fmt::Debug, B: std::fmt::Debug> std::fmt::Debug for RacePair<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeftWon(a, _) => f.debug_tuple("LeftWon").field(a).finish(),
            Self::RightWon(_, b) => f.debug_tuple("RightWon").field(b).finish(),
        }
    }
}

/// Races two effects; the loser is cancelled.
#[must_use]
pub fn race<A, B>(left: Effect<A>, right: Effect<B>) -> Effect<Either<A, B>>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    race_pair(left, right).flat_map(|outcome| match outcome {
        RacePair::LeftWon(a, loser) => loser.cancel().map(move |()| Either::Left(a)),
        RacePair::RightWon(loser, b) => loser.cancel().map(move |()| Either::Right(b)),
    })
}

/// Races two effects; the loser's fiber is returned still running.
///
/// If the first effect to terminate fails, the race fails with that error
/// and the other side is cancelled. Cancelling the race cancels both sides.
#[must_use]
pub fn race_pair<A, B>(left: Effect<A>, right: Effect<B>) -> Effect<RacePair<A, B>>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    Effect::cancellable(move |cb: AsyncCallback<RacePair<A, B>>| {
        let left_scope = CancelScope::new();
        let right_scope = CancelScope::new();
        let left_cell: Deferred<Result<A>> = Deferred::new();
        let right_cell: Deferred<Result<B>> = Deferred::new();
        let left_fiber = Fiber::from_parts(left_scope.clone(), left_cell.clone());
        let right_fiber = Fiber::from_parts(right_scope.clone(), right_cell.clone());
        let decided = Arc::new(AtomicBool::new(false));

        {
            let cb = cb.clone();
            let decided = Arc::clone(&decided);
            let cell = left_cell;
            let loser = right_fiber.clone();
            let node = left.into_node();
            submit_racer(Box::new(move || {
                run_loop::run(
                    node,
                    left_scope,
                    Box::new(move |outcome| {
                        let outcome = outcome.map(unbox::<A>);
                        let _ = cell.complete_now(outcome.clone());
                        if decided.swap(true, Ordering::AcqRel) {
                            return;
                        }
                        match outcome {
                            Ok(a) => cb.complete(Ok(RacePair::LeftWon(a, loser))),
                            Err(error) => {
                                trace!("left racer failed first, cancelling right");
                                run_loop::run_detached(loser.cancel().into_node());
                                cb.complete(Err(error));
                            }
                        }
                    }),
                );
            }));
        }
        {
            let cb = cb.clone();
            let decided = Arc::clone(&decided);
            let cell = right_cell;
            let loser = left_fiber.clone();
            let node = right.into_node();
            submit_racer(Box::new(move || {
                run_loop::run(
                    node,
                    right_scope,
                    Box::new(move |outcome| {
                        let outcome = outcome.map(unbox::<B>);
                        let _ = cell.complete_now(outcome.clone());
                        if decided.swap(true, Ordering::AcqRel) {
                            return;
                        }
                        match outcome {
                            Ok(b) => cb.complete(Ok(RacePair::RightWon(loser, b))),
                            Err(error) => {
                                trace!("right racer failed first, cancelling left");
                                run_loop::run_detached(loser.cancel().into_node());
                                cb.complete(Err(error));
                            }
                        }
                    }),
                );
            }));
        }

        // Cancelling the race cancels both sides, finalizers and all.
        left_fiber
            .cancel()
            .flat_map(move |()| right_fiber.cancel())
    })
}

fn submit_racer(task: Box<dyn FnOnce() + Send>) {
    if let Err(error) = pool::default_pool().submit(task) {
        trace!(error = %error, "racer submission rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::mpsc;
    use std::time::Duration;

    fn block_on<A: Clone + Send + 'static>(effect: Effect<A>) -> Result<A> {
        let (tx, rx) = mpsc::channel();
        effect.run_async(move |outcome| {
            tx.send(outcome).expect("send");
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("effect did not terminate")
    }

    #[test]
    fn immediate_left_wins_over_never() {
        let outcome = block_on(race(Effect::pure(1), Effect::<u8>::never())).expect("race");
        assert_eq!(outcome, Either::Left(1));
    }

    #[test]
    fn immediate_right_wins_over_never() {
        let outcome = block_on(race(Effect::<u8>::never(), Effect::pure(2))).expect("race");
        assert_eq!(outcome, Either::Right(2));
    }

    #[test]
    fn gated_winner_decides() {
        let gate: Deferred<u32> = Deferred::new();
        let opened = gate.clone();
        let slow = Effect::<u8>::never();
        let fast = gate.get();
        let (tx, rx) = mpsc::channel();
        race(fast, slow).run_async(move |outcome| {
            tx.send(outcome).expect("send");
        });
        assert!(rx.try_recv().is_err());

        opened.complete(7).run_sync().expect("open gate");
        let outcome = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("race hung")
            .expect("race failed");
        assert_eq!(outcome, Either::Left(7));
    }

    #[test]
    fn first_failure_fails_the_race() {
        let failing: Effect<u8> = Effect::raise_error(Error::user("fast failure"));
        let err = block_on(race(failing, Effect::<u8>::never())).expect_err("race must fail");
        assert_eq!(err.to_string(), "User: fast failure");
    }

    #[test]
    fn race_pair_returns_running_loser() {
        let gate: Deferred<u32> = Deferred::new();
        let opened = gate.clone();
        let effect = race_pair(Effect::pure(1_u8), gate.get()).flat_map(move |outcome| {
            match outcome {
                RacePair::LeftWon(a, loser) => opened
                    .complete(40)
                    .flat_map(move |()| loser.join())
                    .map(move |b| (a, b)),
                RacePair::RightWon(..) => unreachable!("left side is immediate"),
            }
        });
        let (a, b) = block_on(effect).expect("race pair");
        assert_eq!((a, b), (1, 40));
    }
}
