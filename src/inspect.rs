//! Typed stack inspection.
//!
//! Unlike the other walk purposes this one allocates: every frame becomes a
//! [`StackFrame`] snapshot that outlives the walk. It is meant for debuggers
//! and diagnostic dumps, never for code running during a collection.
//!
//! Snapshots link to their callee by index into the [`StackTrace`] that
//! holds them, so the frame list can be navigated both ways without
//! reference cycles.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::code::MethodKind;
use crate::walk::StackFrameWalker;
use crate::{Addr, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFrame {
    /// Method name, or a synthetic name for stubs.
    pub name: String,
    pub kind: MethodKind,
    pub code_start: Addr,
    pub ip: Addr,
    pub sp: Addr,
    pub fp: Addr,
    /// Position of `ip` in the method.
    pub pos: usize,
    pub is_top_frame: bool,
    pub callee: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFrame {
    pub ip: Addr,
    pub sp: Addr,
    pub fp: Addr,
    /// Dynamic symbol containing `ip`, when there is one.
    pub symbol: Option<String>,
    pub callee: Option<usize>,
}

/// Stands in for the rest of the stack when the walk failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub error: Error,
    pub message: String,
    pub callee: Option<usize>,
}

/// Stands in for the frames not shown because of a [`FrameLimit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedFrame {
    pub limit: usize,
    pub callee: Option<usize>,
}

/// A snapshot of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackFrame {
    Managed(ManagedFrame),
    Native(NativeFrame),
    Error(ErrorFrame),
    Truncated(TruncatedFrame),
}

impl StackFrame {
    /// Index of the frame this one called, in the trace holding it.
    pub fn callee(&self) -> Option<usize> {
        match self {
            StackFrame::Managed(f) => f.callee,
            StackFrame::Native(f) => f.callee,
            StackFrame::Error(f) => f.callee,
            StackFrame::Truncated(f) => f.callee,
        }
    }

    pub fn sp(&self) -> Option<Addr> {
        match self {
            StackFrame::Managed(f) => Some(f.sp),
            StackFrame::Native(f) => Some(f.sp),
            StackFrame::Error(_) | StackFrame::Truncated(_) => None,
        }
    }

    /// Whether both snapshots are of the same activation.
    pub fn is_same_frame(&self, other: &StackFrame) -> bool {
        match (self, other) {
            (StackFrame::Managed(a), StackFrame::Managed(b)) => {
                a.code_start == b.code_start && a.ip == b.ip && a.sp == b.sp && a.fp == b.fp
            }
            (StackFrame::Native(a), StackFrame::Native(b)) => a.ip == b.ip && a.sp == b.sp && a.fp == b.fp,
            _ => false,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackFrame::Managed(frame) => {
                write!(f, "{}+{:#x} [sp={} fp={}]", frame.name, frame.pos, frame.sp, frame.fp)
            }
            StackFrame::Native(frame) => {
                match &frame.symbol {
                    Some(symbol) => write!(f, "{symbol} (native)")?,
                    None => write!(f, "<native function {}>", frame.ip)?,
                }
                write!(f, " [sp={} fp={}]", frame.sp, frame.fp)
            }
            StackFrame::Error(frame) => write!(f, "<error: {}>", frame.message),
            StackFrame::Truncated(frame) => {
                write!(f, "<{} frames shown, more not displayed>", frame.limit)
            }
        }
    }
}

/// Receives typed frame snapshots, top of the stack first.
pub trait StackFrameVisitor {
    /// Returns `false` to stop the walk.
    fn visit_frame(&mut self, frame: StackFrame) -> bool;

    fn done(&mut self) {}
}

/// The most frames a trace shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimit {
    max: usize,
}

impl FrameLimit {
    pub fn new(max: usize) -> Self {
        Self { max: max.max(1) }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Show twice as many frames.
    pub fn extend(&mut self) {
        self.max = self.max.saturating_mul(2);
    }
}

impl Default for FrameLimit {
    fn default() -> Self {
        Self::new(crate::options::DEFAULT_MAX_FRAMES_DISPLAY)
    }
}

/// The frames of one stack, top first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    frames: Vec<StackFrame>,
}

impl StackTrace {
    /// Walks the stack from (`ip`, `sp`, `fp`). A walk failure does not fail
    /// the capture: it ends the trace with an error frame.
    pub fn capture(
        walker: &mut StackFrameWalker<'_>,
        ip: Addr,
        sp: Addr,
        fp: Addr,
        anchor: Addr,
        limit: FrameLimit,
    ) -> StackTrace {
        let mut collector = Collector {
            frames: Vec::new(),
            limit,
        };
        if let Err(error) = walker.inspect(ip, sp, fp, anchor, &mut collector) {
            warn!(%error, frames = collector.frames.len(), "stack walk failed during inspection");
            let callee = collector.frames.len().checked_sub(1);
            collector.frames.push(StackFrame::Error(ErrorFrame {
                error,
                message: error.to_string(),
                callee,
            }));
        }
        StackTrace {
            frames: collector.frames,
        }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StackFrame> {
        self.frames.get(index)
    }

    pub fn callee_of(&self, index: usize) -> Option<&StackFrame> {
        self.frames.get(self.frames.get(index)?.callee()?)
    }

    pub fn caller_of(&self, index: usize) -> Option<&StackFrame> {
        self.frames
            .get(index + 1)
            .filter(|frame| frame.callee() == Some(index))
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self.frames.last(), Some(StackFrame::Truncated(_)))
    }

    /// Whether the walk that produced this trace failed.
    pub fn error(&self) -> Option<Error> {
        match self.frames.last() {
            Some(StackFrame::Error(frame)) => Some(frame.error),
            _ => None,
        }
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "  #{i:<3} {frame}")?;
        }
        Ok(())
    }
}

struct Collector {
    frames: Vec<StackFrame>,
    limit: FrameLimit,
}

impl StackFrameVisitor for Collector {
    fn visit_frame(&mut self, frame: StackFrame) -> bool {
        if let Some(previous) = self.frames.last() {
            if previous.is_same_frame(&frame) {
                warn!(%frame, "same frame visited twice, stopping inspection");
                return false;
            }
        }
        if self.frames.len() == self.limit.max() {
            let callee = frame.callee();
            self.frames.push(StackFrame::Truncated(TruncatedFrame {
                limit: self.limit.max(),
                callee,
            }));
            return false;
        }
        self.frames.push(frame);
        true
    }
}
