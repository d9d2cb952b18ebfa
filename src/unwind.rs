//! Exception unwinding state.
//!
//! Unwinding is a walk with [`Purpose::ExceptionHandling`](crate::walk::Purpose):
//! every managed frame is asked for a handler of the thrown value, from the
//! top of the stack down, until one is found or the stack ends.

use crate::code::Throwable;
use crate::Addr;

/// The frame that will handle an exception, where control resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerFrame {
    /// Start of the method the handler is in.
    pub method: Addr,
    /// Address of the handler code.
    pub handler: Addr,
    /// Stack pointer of the handling frame.
    pub sp: Addr,
    /// Frame pointer of the handling frame.
    pub fp: Addr,
    /// Managed frames popped before this one.
    pub frames_unwound: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOutcome {
    /// A frame has a handler for the exception.
    HandlerFound(HandlerFrame),
    /// No managed frame handles it; the thread terminates with it uncaught.
    EndOfStack { frames_unwound: usize },
}

/// Per-unwind state carried through a walk.
pub struct StackUnwindingContext<'a> {
    throwable: &'a dyn Throwable,
    frames_unwound: usize,
    handler: Option<HandlerFrame>,
}

impl<'a> StackUnwindingContext<'a> {
    pub fn new(throwable: &'a dyn Throwable) -> Self {
        Self {
            throwable,
            frames_unwound: 0,
            handler: None,
        }
    }

    pub fn throwable(&self) -> &'a dyn Throwable {
        self.throwable
    }

    pub(crate) fn frame_unwound(&mut self) {
        self.frames_unwound += 1;
    }

    pub(crate) fn found(&mut self, frame: HandlerFrame) {
        debug!(
            handler = %frame.handler,
            sp = %frame.sp,
            frames_unwound = self.frames_unwound,
            "found exception handler"
        );
        self.handler = Some(HandlerFrame {
            frames_unwound: self.frames_unwound,
            ..frame
        });
    }

    pub fn outcome(&self) -> UnwindOutcome {
        match self.handler {
            Some(frame) => UnwindOutcome::HandlerFound(frame),
            None => UnwindOutcome::EndOfStack {
                frames_unwound: self.frames_unwound,
            },
        }
    }
}
