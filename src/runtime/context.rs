//! Per-interpretation breadcrumb context.
//!
//! Created lazily at the first asynchronous boundary of a run and discarded
//! when the terminal callback fires. Used to annotate unhandled failures
//! with how far the interpretation had progressed.

use crate::error::Error;
use crate::tracing_compat::debug;

/// Breadcrumbs for one interpretation.
#[derive(Debug, Default)]
pub(crate) struct RunContext {
    boundaries: u32,
}

impl RunContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records that the run crossed an asynchronous boundary.
    pub(crate) fn record_boundary(&mut self) {
        self.boundaries = self.boundaries.saturating_add(1);
    }

    #[cfg(test)]
    pub(crate) fn boundaries(&self) -> u32 {
        self.boundaries
    }

    /// Emits the breadcrumbs for an error that reached the terminal callback
    /// unhandled.
    pub(crate) fn report_failure(&self, error: &Error) {
        debug!(
            async_boundaries = self.boundaries,
            error = %error,
            "effect failed after asynchronous boundaries"
        );
    }
}
