//! Main-entry facade.
//!
//! A program's main is an `Effect<ExitCode>`; [`run_main`] interprets it,
//! blocks the calling thread until the outcome arrives, and maps it to a
//! process exit code: the carried code on success, `1` on an uncaught
//! error.

use crate::effect::Effect;
use crate::tracing_compat::error;
use std::sync::mpsc;

/// A process exit code carried by a main effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCode(pub i32);

impl ExitCode {
    /// Successful termination.
    pub const SUCCESS: Self = Self(0);
    /// Generic failure.
    pub const ERROR: Self = Self(1);

    /// Creates an exit code.
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    /// The numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

/// Interprets a main effect to completion and returns its exit code.
///
/// Blocks the calling thread. An uncaught error is reported on the process
/// error stream and maps to exit code `1`.
#[must_use]
pub fn run_main(main: Effect<ExitCode>) -> i32 {
    let (tx, rx) = mpsc::channel();
    main.run_async(move |outcome| {
        let _ = tx.send(outcome);
    });
    match rx.recv() {
        Ok(Ok(code)) => code.code(),
        Ok(Err(err)) => {
            error!(error = %err, "main effect failed");
            eprintln!("error: {err}");
            1
        }
        // The run was cancelled out from under us; treat as failure.
        Err(mpsc::RecvError) => 1,
    }
}
