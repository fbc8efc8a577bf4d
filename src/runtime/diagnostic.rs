//! Process-wide diagnostic channel.
//!
//! Two conditions are diagnostics rather than recoverable errors: an async
//! producer completing its callback a second time with an error, and a
//! finalizer failing after another error already won. Both emit a single
//! line here. By default the line goes to the process error stream; tests
//! install a sink to capture it.

use crate::error::Error;
use crate::tracing_compat::error;
use parking_lot::Mutex;

type Sink = Box<dyn Fn(&str) + Send + Sync>;

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Replaces the diagnostic sink. Intended for tests and embedders that
/// route diagnostics into their own logging.
pub fn set_sink(sink: impl Fn(&str) + Send + Sync + 'static) {
    *SINK.lock() = Some(Box::new(sink));
}

/// Restores the default sink (the process error stream).
pub fn clear_sink() {
    *SINK.lock() = None;
}

fn emit(line: &str) {
    error!(target: "pureio::diagnostic", "{line}");
    let sink = SINK.lock();
    match sink.as_ref() {
        Some(sink) => sink(line),
        None => eprintln!("{line}"),
    }
}

/// Reports an error carried by a dropped (second) callback invocation.
pub(crate) fn report_dropped_callback(error: &Error) {
    emit(&format!("dropped async callback carried an error: {error}"));
}

/// Reports a finalizer failure that lost to an earlier error.
pub(crate) fn report_finalizer_error(error: &Error) {
    emit(&format!("finalizer failed after primary outcome: {error}"));
}

/// Reports an error that surfaced from a detached interpretation.
pub(crate) fn report_detached_error(error: &Error) {
    emit(&format!("detached effect failed: {error}"));
}

/// Serializes tests that install a sink; the sink is process-wide.
#[cfg(test)]
pub(crate) fn test_sink_lock() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn sink_captures_lines() {
        let _guard = test_sink_lock();
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let sunk = Arc::clone(&lines);
        set_sink(move |line| sunk.lock().expect("lines poisoned").push(line.to_string()));

        report_dropped_callback(&Error::user("late"));
        report_finalizer_error(&Error::user("cleanup"));
        clear_sink();

        let captured = lines.lock().expect("lines poisoned");
        assert_eq!(captured.len(), 2);
        assert!(captured[0].contains("dropped async callback"));
        assert!(captured[1].contains("finalizer failed"));
    }
}
