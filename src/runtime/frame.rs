//! Continuation frames and the pending-continuation stack.
//!
//! While the run loop descends into a `Bind`/`Map` node it suspends the
//! continuation as a frame. One frame is kept in a hot register by the loop;
//! the overflow lives here, in an array-backed LIFO.

use crate::effect::{BindFn, ErrFn, MapFn};
use smallvec::SmallVec;

/// A suspended continuation.
pub(crate) enum Frame {
    /// Plain value continuation producing the next node.
    Bind(BindFn),
    /// Pure value continuation.
    Map(MapFn),
    /// Continuation with an error-recovery arm. A handler with no success
    /// arm passes values through untouched and only intercepts errors.
    Handler {
        /// Success arm; `None` means pass-through.
        ok: Option<BindFn>,
        /// Failure arm.
        err: ErrFn,
    },
}

impl Frame {
    pub(crate) fn bind(f: BindFn) -> Self {
        Self::Bind(f)
    }

    pub(crate) fn map(f: MapFn) -> Self {
        Self::Map(f)
    }

    pub(crate) fn handler(ok: Option<BindFn>, err: ErrFn) -> Self {
        Self::Handler { ok, err }
    }

    /// Whether this frame intercepts errors.
    pub(crate) fn is_handler(&self) -> bool {
        matches!(self, Self::Handler { .. })
    }

    /// Whether this frame consumes values. Error-only handlers do not.
    pub(crate) fn has_success_arm(&self) -> bool {
        !matches!(self, Self::Handler { ok: None, .. })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(_) => f.write_str("Frame::Bind"),
            Self::Map(_) => f.write_str("Frame::Map"),
            Self::Handler { ok, .. } => f
                .debug_struct("Frame::Handler")
                .field("has_success_arm", &ok.is_some())
                .finish(),
        }
    }
}

/// Array-backed LIFO of pending continuations.
///
/// Small chains stay inline; deep ones spill to the heap, which is what
/// makes arbitrarily nested binds stack-safe.
#[derive(Debug, Default)]
pub(crate) struct CallStack {
    frames: SmallVec<[Frame; 8]>,
}

impl CallStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Node;

    fn noop_bind() -> Frame {
        Frame::bind(Box::new(Node::Pure))
    }

    #[test]
    fn stack_is_lifo() {
        let mut stack = CallStack::new();
        stack.push(noop_bind());
        stack.push(Frame::handler(None, Box::new(Node::RaiseError)));
        assert_eq!(stack.len(), 2);

        let top = stack.pop().expect("top frame");
        assert!(top.is_handler());
        let bottom = stack.pop().expect("bottom frame");
        assert!(!bottom.is_handler());
        assert!(stack.is_empty());
    }

    #[test]
    fn error_only_handler_has_no_success_arm() {
        let frame = Frame::handler(None, Box::new(Node::RaiseError));
        assert!(frame.is_handler());
        assert!(!frame.has_success_arm());

        let both = Frame::handler(Some(Box::new(Node::Pure)), Box::new(Node::RaiseError));
        assert!(both.has_success_arm());
    }

    #[test]
    fn spills_past_inline_capacity() {
        let mut stack = CallStack::new();
        for _ in 0..64 {
            stack.push(noop_bind());
        }
        assert_eq!(stack.len(), 64);
        for _ in 0..64 {
            assert!(stack.pop().is_some());
        }
        assert!(stack.pop().is_none());
    }
}
