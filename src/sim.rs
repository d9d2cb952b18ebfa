//! Simulated thread stacks.
//!
//! [`SimStack`] lays out frames over a vector of words exactly as compiled
//! code would: return address and saved frame pointer at the end of each
//! frame, exit anchors in native stubs, entry anchors in VM entry points and
//! saved registers in trap stubs. Frames are pushed from the bottom of the
//! stack up, so a stack is described in the order its calls happened.
//!
//! ```text
//! let mut stack = SimStack::new(&code, Platform::host(), 256, 4);
//! stack.enter(run, THREAD_START).call(main, 0x10).call(leaf, 0x20).stop_at(0x8);
//! ```

use alloc::vec;
use alloc::vec::Vec;

use crate::anchor::FrameAnchor;
use crate::arch::Platform;
use crate::code::{
    ClassId, CodeRegion, CompiledMethod, ExceptionHandler, FrameRefMap, MethodKind, TargetMethod,
};
use crate::layout::FrameLayout;
use crate::memory::{StackMemory, StackRegion};
use crate::refmap::HeapBounds;
use crate::thread::{ThreadContext, TrapState};
use crate::{Addr, Result, WORD_SIZE};

/// Lowest address of every simulated stack.
pub const STACK_BASE: Addr = Addr(0x4000_0000);

/// Where methods are installed.
pub const CODE_BASE: Addr = Addr(0x1000_0000);

/// Return address into the native thread start routine.
pub const THREAD_START: Addr = Addr(0x7000_0010);

/// A heap for simulated objects. Odd values are tagged.
pub const HEAP: HeapBounds = HeapBounds {
    start: Addr(0x2000_0000),
    end: Addr(0x3000_0000),
    tag_mask: 1,
};

/// The address of the `n`th simulated object.
pub const fn object(n: usize) -> usize {
    HEAP.start.addr() + n * 4 * WORD_SIZE
}

/// Where native code called through [`Program::stub`] executes.
pub const NATIVE_PC: Addr = Addr(0x7000_1000);

/// Return address into native code that called [`Program::callback`].
pub const NATIVE_RETURN: Addr = Addr(0x7000_1040);

/// The exception class `helper` catches.
pub const CAUGHT: ClassId = ClassId(7);

/// A small program installed in a code region, with the call positions its
/// methods use:
///
/// ```text
/// run       VM entry point, calls main at 0x10
/// main      calls helper at 0x20 and the native stub at 0x28
/// helper    one parameter; calls leaf at 0x30, traps at 0x34 with operand 0
///           and saved registers 0 and 2 holding references; catches
///           CAUGHT thrown in [0x20, 0x40) at 0x80
/// leaf      stops at 0x8 with a reference in local 0
/// stub      native stub, calls native code at 0x10 with a reference in local 0
/// callback  VM entry point called from native code, calls leaf at 0x10
/// trap      trap stub saving 4 registers, calls the native stub at 0x10
/// ```
///
/// The fields are the methods' indices in `code`.
pub struct Program {
    pub code: CodeRegion,
    pub run: usize,
    pub main: usize,
    pub helper: usize,
    pub leaf: usize,
    pub stub: usize,
    pub callback: usize,
    pub trap: usize,
}

impl Program {
    pub fn new() -> Result<Self> {
        let mut code = CodeRegion::new(CODE_BASE);

        let layout = FrameLayout::new(1, 0, 0)?;
        let run = code.install(
            CompiledMethod::builder(MethodKind::VmEntryPoint, layout)
                .name("VmThread.run")
                .empty_safepoint(0x10)
                .build(),
        );

        let layout = FrameLayout::new(2, 1, 0)?;
        let main = code.install(
            CompiledMethod::builder(MethodKind::Normal, layout)
                .name("main")
                .empty_safepoint(0x20)
                .empty_safepoint(0x28)
                .build(),
        );

        let layout = FrameLayout::new(2, 1, 1)?;
        let helper = code.install(
            CompiledMethod::builder(MethodKind::Normal, layout)
                .name("helper")
                .empty_safepoint(0x30)
                .safepoint(0x34, FrameRefMap::new(&layout).with_operand(&layout, 0), 0b0101)
                .handler(ExceptionHandler {
                    start: 0x20,
                    end: 0x40,
                    handler: 0x80,
                    catch_type: Some(CAUGHT),
                })
                .build(),
        );

        let layout = FrameLayout::new(2, 0, 0)?;
        let leaf = code.install(
            CompiledMethod::builder(MethodKind::Normal, layout)
                .name("leaf")
                .safepoint(0x8, FrameRefMap::new(&layout).with_local(&layout, 0), 0)
                .build(),
        );

        let layout = FrameLayout::new(1, 0, 0)?;
        let stub = code.install(
            CompiledMethod::builder(MethodKind::NativeStub, layout)
                .safepoint(0x10, FrameRefMap::new(&layout).with_local(&layout, 0), 0)
                .build(),
        );

        let callback = code.install(
            CompiledMethod::builder(MethodKind::VmEntryPoint, layout)
                .empty_safepoint(0x10)
                .build(),
        );

        let layout = FrameLayout::new(0, 0, 0)?;
        let trap = code.install(
            CompiledMethod::builder(MethodKind::TrapStub, layout)
                .callee_save(4)
                .empty_safepoint(0x10)
                .build(),
        );

        Ok(Self {
            code,
            run,
            main,
            helper,
            leaf,
            stub,
            callback,
            trap,
        })
    }

    pub fn method(&self, index: usize) -> &CompiledMethod {
        self.code.method(index)
    }
}

/// A frame on a simulated stack. Addresses are unbiased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimFrame {
    /// Index of the method in the code region, `None` for native code.
    pub method: Option<usize>,
    /// Where the frame is executing: its callee's return address, or the
    /// stop position of the top frame.
    pub ip: Addr,
    pub sp: Addr,
    pub fp: Addr,
}

pub struct SimStack<'c> {
    code: &'c CodeRegion,
    platform: Platform,
    words: Vec<usize>,
    spill_slots: usize,
    last_anchor: Addr,
    /// Bottom of the stack first.
    frames: Vec<SimFrame>,
}

impl<'c> SimStack<'c> {
    /// An empty stack of `words` words whose first `spill_slots` words are the
    /// register spill area.
    pub fn new(code: &'c CodeRegion, platform: Platform, words: usize, spill_slots: usize) -> Self {
        Self {
            code,
            platform,
            words: vec![0; words],
            spill_slots,
            last_anchor: Addr::ZERO,
            frames: Vec::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn end(&self) -> Addr {
        STACK_BASE.plus_words(self.words.len())
    }

    pub fn highest_slot(&self) -> Addr {
        self.end().minus(WORD_SIZE)
    }

    pub fn region(&self) -> StackRegion<'_> {
        StackRegion::new(STACK_BASE, &self.words)
    }

    pub fn last_anchor(&self) -> Addr {
        self.last_anchor
    }

    pub fn frames(&self) -> &[SimFrame] {
        &self.frames
    }

    /// The `i`th frame pushed.
    pub fn frame(&self, i: usize) -> SimFrame {
        self.frames[i]
    }

    /// (ip, sp, fp) of a frame, biased the way registers hold them.
    pub fn registers(&self, frame: &SimFrame) -> (Addr, Addr, Addr) {
        let bias = self.platform.stack_bias;
        (frame.ip, bias.bias_sp(frame.sp), bias.bias_fp(frame.fp))
    }

    /// (ip, sp, fp) of the top frame.
    pub fn top(&self) -> (Addr, Addr, Addr) {
        match self.frames.last() {
            Some(frame) => self.registers(frame),
            None => (Addr::ZERO, Addr::ZERO, Addr::ZERO),
        }
    }

    /// The thread owning this stack.
    pub fn thread(&self, id: u32) -> ThreadContext {
        let mut thread = ThreadContext::new(id, STACK_BASE, self.spill_slots, self.highest_slot())
            .with_stack_bias(self.platform.stack_bias);
        thread.set_last_anchor(self.last_anchor);
        thread
    }

    /// The trap state of a thread stopped in frame `i`.
    pub fn trap_state(&self, i: usize, register_refs: u32) -> TrapState {
        let (pc, sp, fp) = self.registers(&self.frames[i]);
        TrapState {
            pc,
            sp,
            fp,
            register_refs,
        }
    }

    /// Calls VM entry point `method` from native code returning to
    /// `native_return`, and links its entry anchor.
    pub fn enter(&mut self, method: usize, native_return: Addr) -> &mut Self {
        if let Some(caller) = self.frames.last_mut() {
            assert!(caller.method.is_none(), "VM entry points are called from native code");
            caller.ip = native_return;
        }
        let code = self.code;
        let entry = code.method(method);
        assert_eq!(entry.kind(), MethodKind::VmEntryPoint);

        let sp = self.push_managed(method, native_return);
        let anchor = self.anchor_address(entry, sp);
        let bias = self.platform.stack_bias;
        self.write_anchor(
            anchor,
            FrameAnchor {
                previous: self.last_anchor,
                pc: Addr::ZERO,
                sp: bias.bias_sp(sp),
                fp: bias.bias_fp(sp),
            },
        );
        self.last_anchor = anchor;
        self
    }

    /// Calls `method` from the top frame at position `caller_pos`.
    pub fn call(&mut self, method: usize, caller_pos: usize) -> &mut Self {
        let return_address = self.set_top_ip(caller_pos);
        self.push_managed(method, return_address);
        self
    }

    /// Calls native code from the native stub at the top, at `call_pos`. The
    /// native function executes at `native_pc` with a frame of `frame_words`.
    pub fn call_native(&mut self, call_pos: usize, native_pc: Addr, frame_words: usize) -> &mut Self {
        let pc = self.set_top_ip(call_pos);
        let stub_frame = self.top_frame();
        let Some(stub_index) = stub_frame.method else {
            panic!("native code is called through a native stub");
        };
        let code = self.code;
        let stub = code.method(stub_index);
        assert_eq!(stub.kind(), MethodKind::NativeStub);

        let anchor = self.anchor_address(stub, stub_frame.sp);
        let bias = self.platform.stack_bias;
        self.write_anchor(
            anchor,
            FrameAnchor {
                previous: self.last_anchor,
                pc,
                sp: bias.bias_sp(stub_frame.sp),
                fp: bias.bias_fp(stub_frame.fp),
            },
        );
        self.last_anchor = anchor;

        let sp = self.allocate(frame_words * WORD_SIZE);
        self.frames.push(SimFrame {
            method: None,
            ip: native_pc,
            sp,
            fp: sp,
        });
        self
    }

    /// Traps in the top frame at `trapped_pos` into trap stub `stub`, which
    /// saves `registers` in its callee save area.
    pub fn trap(&mut self, stub: usize, trapped_pos: usize, registers: &[usize]) -> &mut Self {
        let trapped = self.set_top_ip(trapped_pos);
        let code = self.code;
        let trap_stub = code.method(stub);
        assert_eq!(trap_stub.kind(), MethodKind::TrapStub);
        let saved = trap_stub.callee_save().map_or(0, |csa| csa.registers);
        assert_eq!(registers.len(), saved, "one value per saved register");

        let sp = self.push_managed(stub, trapped);
        let base = sp.plus(trap_stub.callee_save_offset());
        for (i, &value) in registers.iter().enumerate() {
            self.write(base.plus_words(i), value);
        }
        self
    }

    /// Stops the top frame at position `pos`.
    pub fn stop_at(&mut self, pos: usize) -> &mut Self {
        self.set_top_ip(pos);
        self
    }

    pub fn set_local(&mut self, index: usize, value: usize) -> &mut Self {
        let (frame, method) = self.top_method();
        let offset = method.frame_layout().local_slot_offset(index);
        self.write(frame.sp.plus(offset), value);
        self
    }

    pub fn set_operand(&mut self, index: usize, value: usize) -> &mut Self {
        let (frame, method) = self.top_method();
        let offset = method.frame_layout().operand_slot_offset(index);
        self.write(frame.sp.plus(offset), value);
        self
    }

    /// Stores the value of register `register` in the spill area.
    pub fn set_spill(&mut self, register: usize, value: usize) -> &mut Self {
        assert!(register < self.spill_slots);
        self.write(STACK_BASE.plus_words(register), value);
        self
    }

    pub fn write(&mut self, addr: Addr, value: usize) {
        assert!(addr.is_word_aligned() && addr >= STACK_BASE && addr < self.end());
        self.words[addr.offset_from(STACK_BASE) / WORD_SIZE] = value;
    }

    fn top_frame(&self) -> SimFrame {
        match self.frames.last() {
            Some(frame) => *frame,
            None => panic!("empty simulated stack"),
        }
    }

    fn top_method(&self) -> (SimFrame, &'c CompiledMethod) {
        let frame = self.top_frame();
        let Some(method) = frame.method else {
            panic!("top frame is native");
        };
        let code: &'c CodeRegion = self.code;
        (frame, code.method(method))
    }

    /// Sets the ip of the top managed frame to `pos` and returns it.
    fn set_top_ip(&mut self, pos: usize) -> Addr {
        let (_, method) = self.top_method();
        let ip = method.address_of(pos);
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
        ip
    }

    fn allocate(&self, size: usize) -> Addr {
        let top = self.frames.last().map_or(self.end(), |frame| frame.sp);
        let sp = top.minus(size);
        assert!(
            sp >= STACK_BASE.plus_words(self.spill_slots),
            "simulated stack overflow"
        );
        sp
    }

    fn push_managed(&mut self, index: usize, return_address: Addr) -> Addr {
        let code = self.code;
        let method = code.method(index);
        let sp = self.allocate(method.frame_size());
        let caller_fp = self
            .frames
            .last()
            .map_or(Addr::ZERO, |caller| self.platform.stack_bias.bias_fp(caller.fp));

        self.write(sp.plus(method.return_address_offset()), return_address.addr());
        self.write(sp.plus(method.saved_fp_offset()), caller_fp.addr());
        self.frames.push(SimFrame {
            method: Some(index),
            ip: Addr::ZERO,
            sp,
            fp: sp,
        });
        sp
    }

    fn anchor_address(&self, method: &CompiledMethod, sp: Addr) -> Addr {
        match method.anchor_offset() {
            Some(offset) => sp.plus(offset),
            None => panic!("{} has no frame anchor", method.region_name()),
        }
    }

    fn write_anchor(&mut self, at: Addr, anchor: FrameAnchor) {
        for (i, word) in anchor.to_words().into_iter().enumerate() {
            self.write(at.plus_words(i), word);
        }
    }
}

impl StackMemory for SimStack<'_> {
    fn read_word(&self, addr: Addr) -> Result<usize> {
        self.region().read_word(addr)
    }
}
