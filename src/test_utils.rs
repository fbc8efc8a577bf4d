//! Test utilities.
//!
//! Shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - A blocking bridge over [`Effect::run_async`] for asserting outcomes
//! - Phase/completion macros for readable test output
//!
//! # Example
//! ```ignore
//! use pureio::test_utils::{await_result, init_test_logging};
//!
//! init_test_logging();
//! let value = await_result(Effect::pure(1)).unwrap();
//! ```

use crate::effect::Effect;
use crate::error::Result;
use std::sync::mpsc;
use std::sync::Once;
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Interprets an effect and blocks until its outcome arrives.
///
/// # Panics
///
/// Panics if the run terminates without an outcome (i.e. it was cancelled)
/// or takes longer than ten seconds.
pub fn await_result<A: Send + 'static>(effect: Effect<A>) -> Result<A> {
    await_result_timeout(effect, Duration::from_secs(10))
        .expect("effect terminated without an outcome")
}

/// Like [`await_result`] with an explicit deadline; `None` means no outcome
/// arrived in time (a cancelled or hung run).
pub fn await_result_timeout<A: Send + 'static>(
    effect: Effect<A>,
    timeout: Duration,
) -> Option<Result<A>> {
    let (tx, rx) = mpsc::channel();
    effect.run_async(move |outcome| {
        let _ = tx.send(outcome);
    });
    rx.recv_timeout(timeout).ok()
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::tracing_compat::info!(phase = %$name, "========================================");
        $crate::tracing_compat::info!(phase = %$name, "TEST PHASE: {}", $name);
        $crate::tracing_compat::info!(phase = %$name, "========================================");
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::tracing_compat::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        $crate::tracing_compat::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
