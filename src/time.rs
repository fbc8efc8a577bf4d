//! Timer collaborator hooks.
//!
//! The core consumes time only through this interface; scheduling wheels
//! and virtual clocks live with the embedder. [`ThreadTimer`] is the
//! reference implementation: it parks a worker-pool thread for the
//! duration, which is adequate for tests and small programs.

use crate::effect::Effect;
use crate::error::{Error, ErrorKind};
use crate::runtime::pool::{self, Executor};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// A source of sleeps and monotonic time, expressed as effects.
pub trait Timer: Send + Sync {
    /// An effect completing after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> Effect<()>;

    /// An effect reading monotonic time since an arbitrary fixed anchor.
    fn monotonic_now(&self) -> Effect<Duration>;
}

static ANCHOR: OnceLock<Instant> = OnceLock::new();

fn anchor() -> Instant {
    *ANCHOR.get_or_init(Instant::now)
}

/// A timer that parks a worker-pool thread per sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadTimer;

impl ThreadTimer {
    /// Creates the timer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Timer for ThreadTimer {
    fn sleep(&self, duration: Duration) -> Effect<()> {
        Effect::async_(move |cb| {
            let sleeper = cb.clone();
            let submitted = pool::default_pool().submit(Box::new(move || {
                thread::sleep(duration);
                sleeper.complete(Ok(()));
            }));
            if let Err(error) = submitted {
                cb.complete(Err(Error::new(ErrorKind::Internal)
                    .with_context("sleep submission rejected")
                    .with_source(error)));
            }
        })
    }

    fn monotonic_now(&self) -> Effect<Duration> {
        Effect::delay(|| anchor().elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn sleep_completes() {
        let (tx, rx) = mpsc::channel();
        ThreadTimer::new()
            .sleep(Duration::from_millis(10))
            .run_async(move |outcome| {
                tx.send(outcome).expect("send");
            });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("sleep hung")
            .expect("sleep failed");
    }

    #[test]
    fn monotonic_now_is_monotonic() {
        let timer = ThreadTimer::new();
        let first = timer.monotonic_now().run_sync().expect("now");
        let second = timer.monotonic_now().run_sync().expect("now");
        assert!(second >= first);
    }
}
