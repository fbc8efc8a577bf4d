//! Error types and error handling strategy for the effect runtime.
//!
//! This module defines the core error type threaded through effect
//! interpretation. Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Errors raised inside an effect propagate to the nearest handler frame
//! - Panics in thunks and continuations are isolated and converted to
//!   `ErrorKind::Panicked`
//! - Only errors constructed as fatal bypass handler frames

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Error raised by user code via `raise_error`.
    User,
    /// A panic caught inside a thunk or continuation.
    Panicked,
    /// Non-recoverable error; bypasses handler frames.
    Fatal,
    /// An operation was used outside its state contract
    /// (e.g. completing a `Deferred` twice, `run_sync` on an async effect).
    IllegalState,
    /// Operation was cancelled.
    Cancelled,
    /// Internal runtime error (bug).
    Internal,
}

/// The main error type flowing through effect interpretation.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_context(msg)
    }

    /// Creates an illegal-state error with a message.
    #[must_use]
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState).with_context(msg)
    }

    /// Creates a fatal error with a message.
    ///
    /// Fatal errors are never intercepted by handler frames; they surface
    /// directly to the terminal callback. This is the only fatal predicate
    /// the runtime applies.
    #[must_use]
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal).with_context(msg)
    }

    /// Converts a caught panic payload into an error.
    ///
    /// `&str` and `String` payloads are preserved verbatim; any other
    /// payload is rendered opaquely.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Self::new(ErrorKind::Panicked).with_context(msg)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error bypasses handler frames.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Fatal)
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for effect interpretation.
pub type Result<T> = core::result::Result<T, Error>;
