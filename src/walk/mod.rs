//! The stack frame walker.
//!
//! A walk starts from the (ip, sp, fp) of the top frame of a thread and
//! visits frames from callee to caller. Managed frames are stepped over with
//! their method's [`TargetMethod::advance`]; native code is crossed by
//! resuming at the next native stub anchor in the thread's anchor chain.
//!
//! The walker keeps two cursors, `current` and `callee`. Advancing copies
//! `current` into `callee` and overwrites `current` with the caller, so each
//! frame is visited exactly once and always relative to its own callee.

mod cursor;
#[cfg(test)]
mod tests;

use alloc::string::ToString;
use core::fmt;

pub use cursor::{CalleeSaveArea, StackFrameCursor};

use crate::anchor::{in_java, FrameAnchor};
use crate::arch::Platform;
use crate::code::{CodeCache, MethodKind, TargetMethod, Throwable};
use crate::inspect::{ManagedFrame, NativeFrame, StackFrame, StackFrameVisitor};
use crate::memory::StackMemory;
use crate::preparer::PreparationPass;
use crate::unwind::{HandlerFrame, StackUnwindingContext, UnwindOutcome};
use crate::{identify, Addr, Error, Result};

/// The reasons a stack walk can be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Raising an exception. Allocation free.
    ExceptionHandling,
    /// Preparing the stack reference map for a collection. Allocation free.
    ReferenceMapPreparing,
    /// Reflecting on the frames of a stack through cursors. Allocation free.
    RawInspecting,
    /// Reflecting on the frames of a stack through frame snapshots. Allocates.
    Inspecting,
}

impl Purpose {
    /// Inspection may walk managed frames shadowed by native code.
    pub fn is_inspecting(self) -> bool {
        matches!(self, Purpose::RawInspecting | Purpose::Inspecting)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Purpose::ExceptionHandling => "EXCEPTION_HANDLING",
            Purpose::ReferenceMapPreparing => "REFERENCE_MAP_PREPARING",
            Purpose::RawInspecting => "RAW_INSPECTING",
            Purpose::Inspecting => "INSPECTING",
        })
    }
}

/// Receives the walker's cursors, one call per frame, native frames included.
pub trait RawStackFrameVisitor {
    /// Returns `false` to stop the walk.
    fn visit_frame(&mut self, current: &StackFrameCursor<'_>, callee: &StackFrameCursor<'_>)
        -> bool;

    fn done(&mut self) {}
}

/// The per-frame action of a walk, with the state it needs.
enum WalkContext<'a, 'p> {
    ExceptionHandling(&'a mut StackUnwindingContext<'p>),
    ReferenceMapPreparing(&'a mut PreparationPass<'p>),
    RawInspecting(&'a mut dyn RawStackFrameVisitor),
    Inspecting(&'a mut dyn StackFrameVisitor),
}

impl WalkContext<'_, '_> {
    fn purpose(&self) -> Purpose {
        match self {
            WalkContext::ExceptionHandling(_) => Purpose::ExceptionHandling,
            WalkContext::ReferenceMapPreparing(_) => Purpose::ReferenceMapPreparing,
            WalkContext::RawInspecting(_) => Purpose::RawInspecting,
            WalkContext::Inspecting(_) => Purpose::Inspecting,
        }
    }
}

/// Walks the stack of one thread. Reused across walks; only one walk may be
/// in progress at a time.
pub struct StackFrameWalker<'m> {
    memory: &'m dyn StackMemory,
    code: &'m dyn CodeCache,
    platform: Platform,
    trace: bool,
    /// Name native frames through the dynamic linker of this process.
    native_symbols: bool,
    current: StackFrameCursor<'m>,
    callee: StackFrameCursor<'m>,
    purpose: Option<Purpose>,
    current_anchor: Addr,
    /// Index the next typed frame will get in its inspection's frame list.
    next_frame_index: usize,
}

impl<'m> StackFrameWalker<'m> {
    pub fn new(memory: &'m dyn StackMemory, code: &'m dyn CodeCache, platform: Platform) -> Self {
        Self {
            memory,
            code,
            platform,
            trace: false,
            native_symbols: false,
            current: StackFrameCursor::default(),
            callee: StackFrameCursor::default(),
            purpose: None,
            current_anchor: Addr::ZERO,
            next_frame_index: 0,
        }
    }

    /// Emit a trace event for every frame walked.
    pub fn with_tracing(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Name native frames in typed inspection with the symbols of this
    /// process. Only correct when the walked stack belongs to this process.
    pub fn with_native_symbols(mut self, native_symbols: bool) -> Self {
        self.native_symbols = native_symbols;
        self
    }

    pub fn memory(&self) -> &'m dyn StackMemory {
        self.memory
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Whether a walk is in progress, or an unwind has not been reset yet.
    pub fn is_in_use(&self) -> bool {
        !self.current.sp().is_zero()
    }

    /// The purpose of the walk in progress.
    pub fn purpose(&self) -> Option<Purpose> {
        self.purpose
    }

    /// Walks the stack for inspection with frame snapshots. Resets the walker.
    pub fn inspect(
        &mut self,
        ip: Addr,
        sp: Addr,
        fp: Addr,
        anchor: Addr,
        visitor: &mut dyn StackFrameVisitor,
    ) -> Result<()> {
        self.next_frame_index = 0;
        let result = self.walk(ip, sp, fp, anchor, &mut WalkContext::Inspecting(visitor));
        visitor.done();
        self.reset();
        result
    }

    /// Walks the stack for inspection through cursors. Resets the walker.
    pub fn inspect_raw(
        &mut self,
        ip: Addr,
        sp: Addr,
        fp: Addr,
        anchor: Addr,
        visitor: &mut dyn RawStackFrameVisitor,
    ) -> Result<()> {
        let result = self.walk(ip, sp, fp, anchor, &mut WalkContext::RawInspecting(visitor));
        visitor.done();
        self.reset();
        result
    }

    /// Walks the stack looking for a handler of `throwable`.
    ///
    /// The walker is left in use: the code transferring control to the
    /// handler must [`reset`](Self::reset) it once the frames are popped.
    pub fn unwind(
        &mut self,
        ip: Addr,
        sp: Addr,
        fp: Addr,
        anchor: Addr,
        throwable: &dyn Throwable,
    ) -> Result<UnwindOutcome> {
        let mut context = StackUnwindingContext::new(throwable);
        self.walk(
            ip,
            sp,
            fp,
            anchor,
            &mut WalkContext::ExceptionHandling(&mut context),
        )?;
        Ok(context.outcome())
    }

    /// Walks the stack preparing (or verifying) its reference map. Resets
    /// the walker.
    pub fn prepare_reference_map(
        &mut self,
        ip: Addr,
        sp: Addr,
        fp: Addr,
        anchor: Addr,
        pass: &mut PreparationPass<'_>,
    ) -> Result<()> {
        let result = self.walk(ip, sp, fp, anchor, &mut WalkContext::ReferenceMapPreparing(pass));
        self.reset();
        result
    }

    /// Terminates the current walk.
    pub fn reset(&mut self) {
        if self.trace {
            if let Some(purpose) = self.purpose {
                trace!(%purpose, "finish stack frame walk");
            }
        }
        self.current.reset();
        self.callee.reset();
        self.purpose = None;
        self.current_anchor = Addr::ZERO;
    }

    /// Makes the caller of the current frame the current frame.
    ///
    /// `return_address` is the instruction pointer the caller resumes at,
    /// `sp` and `fp` its stack and frame pointers.
    pub fn advance(&mut self, return_address: Addr, sp: Addr, fp: Addr) {
        self.callee.copy_from(&self.current);
        let target_method = self.target_method_for_return_address(return_address);
        self.current.advance(target_method, return_address, sp, fp);
    }

    fn walk(
        &mut self,
        ip: Addr,
        sp: Addr,
        fp: Addr,
        anchor: Addr,
        context: &mut WalkContext<'_, '_>,
    ) -> Result<()> {
        let purpose = context.purpose();
        self.check_purpose(purpose)?;

        self.current.reset();
        self.callee.reset();

        // The top frame is at a genuine execution point, not a return address.
        let top_method = self.code.target_method_for(ip);
        self.current.start(top_method, ip, sp, fp);

        self.purpose = Some(purpose);
        self.current_anchor = anchor;
        let mut in_native = !in_java(self.memory, anchor)?;
        let mut is_top_frame = true;

        while !self.current.sp().is_zero() {
            let target_method = self.current.target_method();
            let callee_method = self.callee.target_method();
            self.trace_cursor();

            match target_method {
                Some(tm) if !in_native || purpose.is_inspecting() => {
                    in_native = false;
                    check_vm_entry_point_caller(callee_method, tm)?;
                    if !self.walk_frame(tm, context)? {
                        break;
                    }
                }
                _ => {
                    if !self.visit_native_frame(is_top_frame, context) {
                        break;
                    }

                    if in_native {
                        in_native = false;
                        let anchor = self.next_native_stub_anchor()?;
                        self.advance_frame_in_native(anchor, purpose)?;
                    } else {
                        let Some(callee_method) = callee_method else {
                            // A native function that called a VM entry point,
                            // such as the thread start routine.
                            break;
                        };
                        match callee_method.kind() {
                            MethodKind::TrapStub => {
                                // A trap taken while in native code.
                                let anchor = self.next_native_stub_anchor()?;
                                if anchor.is_zero() {
                                    break;
                                }
                                self.advance_frame_in_native(anchor, purpose)?;
                            }
                            MethodKind::VmEntryPoint => {
                                if !self.advance_vm_entry_point_frame()? {
                                    break;
                                }
                            }
                            MethodKind::Normal | MethodKind::NativeStub => {
                                error!(
                                    callee = callee_method.region_name(),
                                    "native code called a method that is not a VM entry point or trap stub"
                                );
                                return Err(Error::NativeCalledNonEntryPoint {
                                    callee: callee_method.code_start(),
                                });
                            }
                        }
                    }
                }
            }
            is_top_frame = false;
        }
        Ok(())
    }

    /// Runs the purpose's action on a managed frame, then advances past it.
    /// Returns `false` if the walk is to stop.
    fn walk_frame(
        &mut self,
        target_method: &'m dyn TargetMethod,
        context: &mut WalkContext<'_, '_>,
    ) -> Result<bool> {
        let proceed = match context {
            WalkContext::ReferenceMapPreparing(pass) => {
                if pass.check_ignore_current_frame() {
                    true
                } else {
                    target_method.prepare_reference_map(&self.current, &self.callee, pass)?;
                    let limit = pass.completing_limit();
                    let sp = self.platform.stack_bias.unbias_sp(self.current.sp());
                    limit.is_zero() || sp < limit
                }
            }
            WalkContext::ExceptionHandling(context) => {
                let throw_ip = if self.current.is_top_frame() {
                    self.current.ip()
                } else {
                    self.platform.call_site_of(self.current.ip())
                };
                match target_method.handler_for(throw_ip, context.throwable()) {
                    Some(handler) => {
                        context.found(HandlerFrame {
                            method: target_method.code_start(),
                            handler,
                            sp: self.current.sp(),
                            fp: self.current.fp(),
                            frames_unwound: 0,
                        });
                        false
                    }
                    None => {
                        context.frame_unwound();
                        true
                    }
                }
            }
            WalkContext::Inspecting(visitor) => {
                let frame = self.managed_frame(target_method);
                visitor.visit_frame(frame)
            }
            WalkContext::RawInspecting(visitor) => visitor.visit_frame(&self.current, &self.callee),
        };

        if !proceed {
            return Ok(false);
        }
        let next = target_method.advance(&self.current, self.memory, &self.platform)?;
        self.current.set_callee_save_area(next.callee_save);
        self.advance(next.return_address, next.sp, next.fp);
        Ok(true)
    }

    /// Gives a native frame to the inspection visitors. Returns `false` if
    /// the walk is to stop.
    fn visit_native_frame(&mut self, is_top_frame: bool, context: &mut WalkContext<'_, '_>) -> bool {
        match context {
            WalkContext::Inspecting(visitor) => {
                let callee = self.take_frame_index();
                let ip = self.current.ip();
                let symbol = if self.native_symbols {
                    identify::identify(ip.addr()).map(ToString::to_string)
                } else {
                    None
                };
                visitor.visit_frame(StackFrame::Native(NativeFrame {
                    ip,
                    sp: self.current.sp(),
                    fp: self.current.fp(),
                    symbol,
                    callee,
                }))
            }
            WalkContext::RawInspecting(visitor) => {
                self.current.set_top_frame(is_top_frame);
                visitor.visit_frame(&self.current, &self.callee)
            }
            WalkContext::ExceptionHandling(_) | WalkContext::ReferenceMapPreparing(_) => true,
        }
    }

    fn managed_frame(&mut self, target_method: &dyn TargetMethod) -> StackFrame {
        let callee = self.take_frame_index();
        StackFrame::Managed(ManagedFrame {
            name: target_method.region_name().to_string(),
            kind: target_method.kind(),
            code_start: target_method.code_start(),
            ip: self.current.ip(),
            sp: self.current.sp(),
            fp: self.current.fp(),
            pos: target_method.pos_for(self.current.ip()),
            is_top_frame: self.current.is_top_frame(),
            callee,
        })
    }

    /// Assigns the next typed frame its index and returns the index of its
    /// callee, the frame visited before it.
    fn take_frame_index(&mut self) -> Option<usize> {
        let callee = self.next_frame_index.checked_sub(1);
        self.next_frame_index += 1;
        callee
    }

    /// Advances through the frame of a VM entry point to the native stub that
    /// (transitively) called it. Returns `false` at the bottom of the stack.
    fn advance_vm_entry_point_frame(&mut self) -> Result<bool> {
        let anchor = self.next_native_stub_anchor()?;
        if anchor.is_zero() {
            return Ok(false);
        }
        let anchor = FrameAnchor::read(self.memory, anchor)?;
        let ip = self.check_native_function_call(anchor.pc, true)?;
        self.advance(ip.unwrap_or(anchor.pc), anchor.sp, anchor.fp);
        Ok(true)
    }

    /// Advances past the first frame of a thread executing in native code.
    fn advance_frame_in_native(&mut self, anchor: Addr, purpose: Purpose) -> Result<()> {
        if anchor.is_zero() {
            return Err(Error::MissingNativeStubAnchor);
        }
        let record = FrameAnchor::read(self.memory, anchor)?;
        if record.pc.is_zero() {
            return Err(Error::AnchorWithoutCaller { anchor });
        }
        let ip = self
            .check_native_function_call(record.pc, !purpose.is_inspecting())?
            .unwrap_or(record.pc);
        self.advance(ip, record.sp, record.fp);
        Ok(())
    }

    /// The next exit anchor, the one in the next native stub frame above the
    /// current stack pointer. Zero if there are no more.
    fn next_native_stub_anchor(&mut self) -> Result<Addr> {
        loop {
            if self.current_anchor.is_zero() {
                // A VM entry point with no managed frames above it.
                return Ok(Addr::ZERO);
            }

            let mut record = FrameAnchor::read(self.memory, self.current_anchor)?;
            if record.is_vm_entry() {
                self.current_anchor = check_anchor_link(self.current_anchor, record.previous)?;
                if self.current_anchor.is_zero() {
                    return Ok(Addr::ZERO);
                }
                record = FrameAnchor::read(self.memory, self.current_anchor)?;
                if record.is_vm_entry() {
                    // Entry and exit anchors always alternate.
                    error!(anchor = %self.current_anchor, "found two adjacent VM entry point frame anchors");
                    return Err(Error::AdjacentEntryAnchors {
                        anchor: self.current_anchor,
                    });
                }
            }

            let anchor = self.current_anchor;
            self.current_anchor = check_anchor_link(anchor, record.previous)?;

            // Skip anchors below the current frame: the walk started further up
            // the stack than the executing frame.
            if record.sp < self.current.sp() {
                continue;
            }
            return Ok(anchor);
        }
    }

    /// Checks that `pc`, taken from an exit anchor, is inside a native stub.
    fn check_native_function_call(&self, pc: Addr, fatal_if_not_found: bool) -> Result<Option<Addr>> {
        if let Some(stub) = self.target_method_for_return_address(pc) {
            if self.trace && self.purpose == Some(Purpose::ReferenceMapPreparing) {
                trace!(
                    stub = stub.region_name(),
                    code_start = %stub.code_start(),
                    pos = stub.pos_for(pc),
                    "ip for stack frame preparation of native stub"
                );
            }
            return Ok(Some(pc));
        }
        if fatal_if_not_found {
            error!(%pc, "could not find native stub for instruction pointer");
            return Err(Error::UnresolvedNativeCall { pc });
        }
        Ok(None)
    }

    fn target_method_for_return_address(&self, return_address: Addr) -> Option<&'m dyn TargetMethod> {
        self.code
            .target_method_for(self.platform.call_site_of(return_address))
    }

    fn check_purpose(&mut self, purpose: Purpose) -> Result<()> {
        if self.trace {
            trace!(%purpose, "start stack frame walk");
        }
        if self.is_in_use() {
            error!(
                in_use_for = ?self.purpose,
                requested = %purpose,
                "stack walker already in use"
            );
            self.current.reset();
            self.callee.reset();
            self.purpose = None;
            return Err(Error::WalkerInUse);
        }
        Ok(())
    }

    fn trace_cursor(&self) {
        if !self.trace {
            return;
        }
        let cursor = &self.current;
        match cursor.target_method() {
            Some(tm) => trace!(
                method = tm.region_name(),
                pos = tm.pos_for(cursor.ip()),
                is_top_frame = cursor.is_top_frame(),
                sp = %cursor.sp(),
                fp = %cursor.fp(),
                "frame"
            ),
            None => trace!(ip = %cursor.ip(), "frame for native function"),
        }
    }
}

/// Older anchors are in older frames, higher up the stack. Returns `previous`.
fn check_anchor_link(anchor: Addr, previous: Addr) -> Result<Addr> {
    if previous.is_zero() || previous > anchor {
        return Ok(previous);
    }
    error!(%anchor, %previous, "frame anchor chain does not ascend the stack");
    Err(Error::AnchorChainNotAscending { anchor, previous })
}

/// A VM entry point must only be called from native code.
fn check_vm_entry_point_caller(
    callee: Option<&dyn TargetMethod>,
    caller: &dyn TargetMethod,
) -> Result<()> {
    match callee {
        Some(callee) if callee.kind() == MethodKind::VmEntryPoint => {
            error!(
                entry_point = callee.region_name(),
                caller = caller.region_name(),
                "caller of VM entry point is not native code"
            );
            Err(Error::EntryPointCalledFromManaged {
                caller: caller.code_start(),
            })
        }
        _ => Ok(()),
    }
}
