use core::fmt;

use crate::code::{CalleeSaveLayout, TargetMethod};
use crate::Addr;

/// A callee save area recorded by a trap stub frame for its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalleeSaveArea {
    pub layout: CalleeSaveLayout,
    pub base: Addr,
}

/// The state of the frame being visited.
///
/// A walker owns exactly two cursors and overwrites them in place; they are
/// never allocated during a walk.
#[derive(Clone, Copy, Default)]
pub struct StackFrameCursor<'m> {
    target_method: Option<&'m dyn TargetMethod>,
    ip: Addr,
    sp: Addr,
    fp: Addr,
    is_top_frame: bool,
    callee_save: Option<CalleeSaveArea>,
}

impl<'m> StackFrameCursor<'m> {
    pub(crate) fn reset(&mut self) {
        *self = StackFrameCursor::default();
    }

    pub(crate) fn start(
        &mut self,
        target_method: Option<&'m dyn TargetMethod>,
        ip: Addr,
        sp: Addr,
        fp: Addr,
    ) {
        *self = StackFrameCursor {
            target_method,
            ip,
            sp,
            fp,
            is_top_frame: true,
            callee_save: None,
        };
    }

    pub(crate) fn advance(
        &mut self,
        target_method: Option<&'m dyn TargetMethod>,
        ip: Addr,
        sp: Addr,
        fp: Addr,
    ) {
        *self = StackFrameCursor {
            target_method,
            ip,
            sp,
            fp,
            is_top_frame: false,
            callee_save: None,
        };
    }

    pub(crate) fn copy_from(&mut self, other: &StackFrameCursor<'m>) {
        *self = *other;
    }

    pub(crate) fn set_callee_save_area(&mut self, area: Option<CalleeSaveArea>) {
        self.callee_save = area;
    }

    pub(crate) fn set_top_frame(&mut self, is_top_frame: bool) {
        self.is_top_frame = is_top_frame;
    }

    /// The method executing in this frame, `None` for native code.
    pub fn target_method(&self) -> Option<&'m dyn TargetMethod> {
        self.target_method
    }

    pub fn is_native(&self) -> bool {
        self.target_method.is_none()
    }

    pub fn ip(&self) -> Addr {
        self.ip
    }

    pub fn sp(&self) -> Addr {
        self.sp
    }

    pub fn fp(&self) -> Addr {
        self.fp
    }

    pub fn is_top_frame(&self) -> bool {
        self.is_top_frame
    }

    /// Position of `ip` within the target method.
    pub fn pos(&self) -> Option<usize> {
        self.target_method.map(|tm| tm.pos_for(self.ip))
    }

    /// The callee save area this frame records for its caller. Only valid
    /// between the frame being advanced past and the next advance.
    pub fn callee_save_area(&self) -> Option<CalleeSaveArea> {
        self.callee_save
    }
}

impl fmt::Debug for StackFrameCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackFrameCursor")
            .field("method", &self.target_method.map(|tm| tm.region_name()))
            .field("ip", &self.ip)
            .field("sp", &self.sp)
            .field("fp", &self.fp)
            .field("is_top_frame", &self.is_top_frame)
            .field("callee_save", &self.callee_save)
            .finish()
    }
}
