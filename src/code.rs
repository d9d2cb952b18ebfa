//! Compiled-method metadata, as far as the stack walker needs it.
//!
//! The walker treats a method as a black box behind [`TargetMethod`]: it asks
//! a method to step from one of its frames to the caller, to contribute its
//! frame's bits to the reference map, and whether it handles an exception.
//! [`CompiledMethod`] is the concrete implementation used by the VM's code
//! region, with the frame shape:
//!
//! ```text
//! high  +---------------------------+
//!       | return address            |  frame_size - 1 word
//!       | caller's frame pointer    |  frame_size - 2 words
//!       | frame anchor (stubs only) |
//!       | callee save area (traps)  |
//!       | operand stack slots       |
//!       | local slots               |  <- sp == fp (unbiased)
//! low   +---------------------------+
//! ```

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::anchor::ANCHOR_WORDS;
use crate::arch::Platform;
use crate::layout::FrameLayout;
use crate::memory::StackMemory;
use crate::preparer::PreparationPass;
use crate::walk::{CalleeSaveArea, StackFrameCursor};
use crate::{Addr, Error, Result, WORD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Ordinary compiled code.
    Normal,
    /// Called from native code: thread start, JNI functions.
    VmEntryPoint,
    /// Wraps a call from managed to native code and writes the exit anchor.
    NativeStub,
    /// Entered on a trap or safepoint signal, saves all registers.
    TrapStub,
}

impl MethodKind {
    /// Name reported for a method of this kind with no source-level method.
    pub fn stub_name(self) -> &'static str {
        match self {
            MethodKind::Normal => "<stub>",
            MethodKind::VmEntryPoint => "<vm entry stub>",
            MethodKind::NativeStub => "<native stub>",
            MethodKind::TrapStub => "<trap stub>",
        }
    }

    fn has_anchor(self) -> bool {
        matches!(self, MethodKind::VmEntryPoint | MethodKind::NativeStub)
    }
}

/// A class of thrown values, as the exception handler tables name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// The value being thrown.
pub trait Throwable {
    fn is_instance_of(&self, class: ClassId) -> bool;
}

impl Throwable for ClassId {
    fn is_instance_of(&self, class: ClassId) -> bool {
        *self == class
    }
}

/// An entry of a method's exception handler table. Covers the positions
/// `[start, end)`; `catch_type` of `None` catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    pub catch_type: Option<ClassId>,
}

/// The registers a trap stub saves, in slot order above its locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalleeSaveLayout {
    pub registers: usize,
}

impl CalleeSaveLayout {
    pub fn size(&self) -> usize {
        self.registers * WORD_SIZE
    }
}

/// Reference bits for a frame's slot area: bit `i` describes the `i`th word
/// above the frame's slot base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRefMap {
    words: Vec<u32>,
    bits: usize,
}

impl FrameRefMap {
    /// A map with no references, sized for `layout`.
    pub fn new(layout: &FrameLayout) -> Self {
        let bits = layout.reference_map_bits();
        Self {
            words: vec![0; bits.div_ceil(u32::BITS as usize)],
            bits,
        }
    }

    fn with_bit(mut self, index: usize) -> Self {
        assert!(index < self.bits, "reference map bit {index} outside frame");
        self.words[index / 32] |= 1 << (index % 32);
        self
    }

    pub fn with_local(self, layout: &FrameLayout, index: usize) -> Self {
        self.with_bit(layout.local_slot_ref_map_index(index))
    }

    pub fn with_operand(self, layout: &FrameLayout, index: usize) -> Self {
        self.with_bit(layout.operand_slot_ref_map_index(index))
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < self.bits && (self.words[index / 32] >> (index % 32)) & 1 != 0
    }

    /// The map in pieces of at most 32 bits: `(first bit, bits, count)`.
    pub fn chunks(&self) -> impl Iterator<Item = (usize, u32, u32)> + '_ {
        self.words.iter().enumerate().map(|(i, &bits)| {
            let base = i * 32;
            let count = (self.bits - base).min(32) as u32;
            (base, bits, count)
        })
    }
}

/// The reference maps in effect at one position in a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Safepoint {
    pub pos: usize,
    pub frame_refs: FrameRefMap,
    /// Bit `i` set if register `i` holds a reference. Applied to the callee
    /// save area of a trap stub called from this position.
    pub register_refs: u32,
}

/// Where a frame's caller resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAdvance {
    pub return_address: Addr,
    pub sp: Addr,
    pub fp: Addr,
    pub callee_save: Option<CalleeSaveArea>,
}

/// The compiled code of one method, seen from the stack walker.
pub trait TargetMethod {
    fn kind(&self) -> MethodKind;

    /// The source-level method name, `None` for stubs.
    fn method_name(&self) -> Option<&str>;

    /// A name for display; stubs get a synthetic one.
    fn region_name(&self) -> &str {
        self.method_name().unwrap_or_else(|| self.kind().stub_name())
    }

    fn code_start(&self) -> Addr;

    fn code_size(&self) -> usize;

    fn contains(&self, ip: Addr) -> bool {
        ip >= self.code_start() && ip < self.code_start().plus(self.code_size())
    }

    fn pos_for(&self, ip: Addr) -> usize {
        ip.offset_from(self.code_start())
    }

    fn frame_layout(&self) -> &FrameLayout;

    /// Computes where the caller of the frame at `cursor` resumes.
    fn advance(
        &self,
        cursor: &StackFrameCursor<'_>,
        memory: &dyn StackMemory,
        platform: &Platform,
    ) -> Result<FrameAdvance>;

    /// Contributes this frame's reference bits, and those of the callee save
    /// area of `callee` if it has one.
    fn prepare_reference_map(
        &self,
        current: &StackFrameCursor<'_>,
        callee: &StackFrameCursor<'_>,
        pass: &mut PreparationPass<'_>,
    ) -> Result<()>;

    /// The handler address for `throwable` thrown at `throw_ip`, if any.
    fn handler_for(&self, throw_ip: Addr, throwable: &dyn Throwable) -> Option<Addr>;
}

/// Finds the method containing an instruction address.
pub trait CodeCache {
    fn target_method_for(&self, ip: Addr) -> Option<&dyn TargetMethod>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMethod {
    name: Option<String>,
    kind: MethodKind,
    code_start: Addr,
    code_size: usize,
    layout: FrameLayout,
    callee_save: Option<CalleeSaveLayout>,
    safepoints: Vec<Safepoint>,
    handlers: Vec<ExceptionHandler>,
}

impl CompiledMethod {
    pub fn builder(kind: MethodKind, layout: FrameLayout) -> CompiledMethodBuilder {
        CompiledMethodBuilder {
            method: CompiledMethod {
                name: None,
                kind,
                code_start: Addr::ZERO,
                code_size: 0x100,
                layout,
                callee_save: None,
                safepoints: Vec::new(),
                handlers: Vec::new(),
            },
        }
    }

    pub fn address_of(&self, pos: usize) -> Addr {
        self.code_start.plus(pos)
    }

    pub fn callee_save(&self) -> Option<CalleeSaveLayout> {
        self.callee_save
    }

    pub fn callee_save_offset(&self) -> usize {
        self.layout.size_of_slots()
    }

    /// Offset of the frame anchor, for native stubs and VM entry points.
    pub fn anchor_offset(&self) -> Option<usize> {
        self.kind
            .has_anchor()
            .then(|| self.callee_save_offset() + self.callee_save.map_or(0, |csa| csa.size()))
    }

    pub fn frame_size(&self) -> usize {
        let anchor = if self.kind.has_anchor() {
            ANCHOR_WORDS * WORD_SIZE
        } else {
            0
        };
        self.callee_save_offset() + self.callee_save.map_or(0, |csa| csa.size()) + anchor + 2 * WORD_SIZE
    }

    pub fn saved_fp_offset(&self) -> usize {
        self.frame_size() - 2 * WORD_SIZE
    }

    pub fn return_address_offset(&self) -> usize {
        self.frame_size() - WORD_SIZE
    }

    /// The safepoint at `pos` and its index in the safepoint table.
    pub fn safepoint_at(&self, pos: usize) -> Option<(usize, &Safepoint)> {
        let index = self.safepoints.binary_search_by_key(&pos, |sp| sp.pos).ok()?;
        Some((index, &self.safepoints[index]))
    }

    pub fn safepoints(&self) -> &[Safepoint] {
        &self.safepoints
    }
}

impl TargetMethod for CompiledMethod {
    fn kind(&self) -> MethodKind {
        self.kind
    }

    fn method_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn code_start(&self) -> Addr {
        self.code_start
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn frame_layout(&self) -> &FrameLayout {
        &self.layout
    }

    fn advance(
        &self,
        cursor: &StackFrameCursor<'_>,
        memory: &dyn StackMemory,
        platform: &Platform,
    ) -> Result<FrameAdvance> {
        let bias = platform.stack_bias;
        let sp = bias.unbias_sp(cursor.sp());
        let return_address = memory.read_addr(sp.plus(self.return_address_offset()))?;
        let fp = memory.read_addr(sp.plus(self.saved_fp_offset()))?;
        let callee_save = self.callee_save.map(|layout| CalleeSaveArea {
            layout,
            base: sp.plus(self.callee_save_offset()),
        });
        Ok(FrameAdvance {
            return_address,
            sp: bias.bias_sp(sp.plus(self.frame_size())),
            fp,
            callee_save,
        })
    }

    fn prepare_reference_map(
        &self,
        current: &StackFrameCursor<'_>,
        callee: &StackFrameCursor<'_>,
        pass: &mut PreparationPass<'_>,
    ) -> Result<()> {
        let pos = self.pos_for(current.ip());
        let (index, safepoint) = self.safepoint_at(pos).ok_or(Error::MissingSafepoint {
            method: self.code_start,
            pos,
        })?;
        let slot_base = pass.bias().unbias_fp(current.fp());
        pass.log_prepare(self.region_name(), index, slot_base);

        if let Some(csa) = callee.callee_save_area() {
            pass.visit_reference_map_bits(
                current,
                csa.base,
                safepoint.register_refs,
                csa.layout.registers as u32,
            )?;
        }

        for (first_bit, bits, count) in safepoint.frame_refs.chunks() {
            pass.visit_reference_map_bits(current, slot_base.plus_words(first_bit), bits, count)?;
        }
        Ok(())
    }

    fn handler_for(&self, throw_ip: Addr, throwable: &dyn Throwable) -> Option<Addr> {
        let pos = self.pos_for(throw_ip);
        self.handlers
            .iter()
            .find(|h| {
                (h.start..h.end).contains(&pos)
                    && h.catch_type.map_or(true, |class| throwable.is_instance_of(class))
            })
            .map(|h| self.address_of(h.handler))
    }
}

pub struct CompiledMethodBuilder {
    method: CompiledMethod,
}

impl CompiledMethodBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.method.name = Some(name.into());
        self
    }

    pub fn code_size(mut self, size: usize) -> Self {
        self.method.code_size = size;
        self
    }

    pub fn callee_save(mut self, registers: usize) -> Self {
        self.method.callee_save = Some(CalleeSaveLayout { registers });
        self
    }

    pub fn safepoint(mut self, pos: usize, frame_refs: FrameRefMap, register_refs: u32) -> Self {
        assert_eq!(frame_refs.len(), self.method.layout.reference_map_bits());
        let at = self
            .method
            .safepoints
            .partition_point(|sp| sp.pos < pos);
        self.method.safepoints.insert(
            at,
            Safepoint {
                pos,
                frame_refs,
                register_refs,
            },
        );
        self
    }

    /// A safepoint with no references anywhere.
    pub fn empty_safepoint(self, pos: usize) -> Self {
        let refs = FrameRefMap::new(&self.method.layout);
        self.safepoint(pos, refs, 0)
    }

    pub fn handler(mut self, handler: ExceptionHandler) -> Self {
        self.method.handlers.push(handler);
        self
    }

    pub fn build(self) -> CompiledMethod {
        self.method
    }
}

/// The VM's code cache: methods laid out one after another from a base
/// address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion {
    start: Addr,
    end: Addr,
    methods: Vec<CompiledMethod>,
}

impl CodeRegion {
    pub fn new(start: Addr) -> Self {
        Self {
            start,
            end: start,
            methods: Vec::new(),
        }
    }

    /// Places `method` after the last installed method and returns its index.
    pub fn install(&mut self, mut method: CompiledMethod) -> usize {
        method.code_start = self.end;
        self.end = self.end.plus(method.code_size);
        debug!(
            name = method.region_name(),
            code_start = %method.code_start,
            "installed compiled method"
        );
        self.methods.push(method);
        self.methods.len() - 1
    }

    pub fn method(&self, index: usize) -> &CompiledMethod {
        &self.methods[index]
    }

    pub fn methods(&self) -> &[CompiledMethod] {
        &self.methods
    }

    pub fn contains(&self, ip: Addr) -> bool {
        ip >= self.start && ip < self.end
    }
}

impl CodeCache for CodeRegion {
    fn target_method_for(&self, ip: Addr) -> Option<&dyn TargetMethod> {
        if !self.contains(ip) {
            return None;
        }
        let after = self.methods.partition_point(|m| m.code_start <= ip);
        let method = self.methods.get(after.checked_sub(1)?)?;
        method.contains(ip).then_some(method as &dyn TargetMethod)
    }
}
