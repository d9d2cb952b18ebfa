//! Stack reference map preparation.
//!
//! Before a collection scans a thread's stack, the thread's reference map is
//! prepared: the active part of the map is cleared and every managed frame
//! contributes the bits of its safepoint's reference map. The collector then
//! finds roots with [`ThreadContext::scan_references`] alone, without
//! walking frames or touching method metadata.
//!
//! A preparer can also verify: every bit a frame contributes is checked
//! against the current contents of its slot with a [`ReferenceOracle`].
//!
//! Nothing here allocates.

#[cfg(test)]
mod tests;

use crate::anchor::FrameAnchor;
use crate::bias::StackBias;
use crate::memory::StackMemory;
use crate::options::Options;
use crate::refmap::{ReferenceMap, ReferenceOracle};
use crate::thread::{ThreadContext, TrapState};
use crate::walk::{StackFrameCursor, StackFrameWalker};
use crate::{Addr, Error, Result, WORD_SIZE};

/// Counters of the last preparation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreparationStats {
    pub frames_prepared: usize,
    pub bits_set: usize,
}

#[derive(Debug)]
pub struct StackReferenceMapPreparer {
    verify: bool,
    prepare: bool,
    /// Skip the next frame walked. Reset once a frame has been skipped.
    ignore_current_frame: bool,
    /// While completing a map: the lowest slot already prepared.
    completing_limit: Addr,
    stats: PreparationStats,
    scan_count: usize,
    log_suppression_count: usize,
}

impl StackReferenceMapPreparer {
    pub fn new(verify: bool, prepare: bool) -> Self {
        Self {
            verify,
            prepare,
            ignore_current_frame: false,
            completing_limit: Addr::ZERO,
            stats: PreparationStats::default(),
            scan_count: 0,
            log_suppression_count: 0,
        }
    }

    /// A preparer that checks frames' reference maps without writing any bits.
    pub fn verifier() -> Self {
        Self::new(true, false)
    }

    pub fn from_options(options: &Options) -> Self {
        Self {
            log_suppression_count: options.log_suppression_count,
            ..Self::new(options.verify_ref_maps, true)
        }
    }

    pub fn stats(&self) -> PreparationStats {
        self.stats
    }

    /// Stack root scans started by this preparer.
    pub fn scan_count(&self) -> usize {
        self.scan_count
    }

    /// Whether root scan events are logged for the current scan.
    fn log_scan(&self) -> bool {
        self.log_suppression_count == 0
    }

    fn start_scan(&mut self, thread: &ThreadContext, sp: Addr) {
        self.log_suppression_count = self.log_suppression_count.saturating_sub(1);
        self.scan_count += 1;
        self.stats = PreparationStats::default();
        if self.log_scan() {
            let map = thread.reference_map();
            debug!(
                scan = self.scan_count,
                thread = thread.id(),
                prepare = self.prepare,
                verify = self.verify,
                %sp,
                highest = %thread.highest_stack_slot(),
                sp_bit = map.bit_index(sp),
                highest_bit = map.bit_index(thread.highest_stack_slot()),
                "start stack root scan"
            );
        }
    }

    /// Prepares the map of a thread blocked in native code, starting from the
    /// head of its anchor chain.
    pub fn prepare_stack_reference_map(
        &mut self,
        walker: &mut StackFrameWalker<'_>,
        thread: &mut ThreadContext,
        oracle: &dyn ReferenceOracle,
    ) -> Result<()> {
        let head = thread.last_anchor();
        if head.is_zero() {
            // The thread has left its run method but is not detached yet: it
            // has no managed frames.
            clear_spill_area(thread)?;
            let (lowest_active, highest) = (thread.lowest_active_slot(), thread.highest_stack_slot());
            thread.reference_map_mut().clear_range(lowest_active, highest)?;
            thread.set_lowest_active_slot(highest);
            if self.log_scan() {
                debug!(thread = thread.id(), "empty stack reference map");
            }
            return Ok(());
        }
        let anchor = FrameAnchor::read(walker.memory(), head)?;
        if anchor.pc.is_zero() {
            error!(thread = thread.id(), "thread is not stopped");
            return Err(Error::ThreadNotStopped);
        }
        self.prepare_stack_reference_map_at(walker, thread, oracle, anchor.pc, anchor.sp, anchor.fp, false)
    }

    /// Prepares the map for the whole stack of `thread`, from the frame at
    /// (`ip`, `sp`, `fp`) down.
    ///
    /// The slots below `sp` are not covered; `sp` becomes the thread's lowest
    /// active slot.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_stack_reference_map_at(
        &mut self,
        walker: &mut StackFrameWalker<'_>,
        thread: &mut ThreadContext,
        oracle: &dyn ReferenceOracle,
        ip: Addr,
        sp: Addr,
        fp: Addr,
        ignore_top_frame: bool,
    ) -> Result<()> {
        self.ignore_current_frame = ignore_top_frame;
        let bias = walker.platform().stack_bias;
        let lowest_active = bias.unbias_sp(sp);
        let highest = thread.highest_stack_slot();

        thread.set_lowest_active_slot(lowest_active);
        self.start_scan(thread, lowest_active);
        clear_spill_area(thread)?;
        thread.reference_map_mut().clear_range(lowest_active, highest)?;

        let anchor = thread.last_anchor();
        let thread_id = thread.id();
        let memory = walker.memory();
        let mut pass = PreparationPass {
            preparer: self,
            map: thread.reference_map_mut(),
            memory,
            oracle,
            bias,
            thread_id,
            safepoint: 0,
        };
        let result = walker.prepare_reference_map(ip, sp, fp, anchor, &mut pass);
        self.ignore_current_frame = false;
        result?;

        if self.log_scan() {
            debug!(
                thread = thread_id,
                frames = self.stats.frames_prepared,
                bits = self.stats.bits_set,
                "finished stack root scan"
            );
        }
        Ok(())
    }

    /// Prepares the map of a thread stopped by a trap, including the
    /// registers it had saved in its spill area.
    pub fn prepare_stack_reference_map_from_trap(
        &mut self,
        walker: &mut StackFrameWalker<'_>,
        thread: &mut ThreadContext,
        oracle: &dyn ReferenceOracle,
        trap: &TrapState,
    ) -> Result<()> {
        self.prepare_stack_reference_map_at(walker, thread, oracle, trap.pc, trap.sp, trap.fp, false)?;

        // Cleared by the preparation above.
        let Some((low, _)) = thread.spill_area() else {
            return Ok(());
        };
        let count = thread.spill_slots().min(u32::BITS as usize) as u32;
        let map = thread.reference_map_mut();
        map.set_bits(map.bit_index(low), trap.register_refs, count)?;
        self.stats.bits_set += trap.register_refs.count_ones() as usize;
        if self.log_scan() {
            debug!(
                thread = thread.id(),
                registers = trap.register_refs,
                "marked register spill area"
            );
        }
        Ok(())
    }

    /// Completes the map of a thread that was stopped at a safepoint while
    /// in managed code and then blocked in native code.
    ///
    /// The map was prepared from the trap down. The frames between the trap
    /// frame and the native stub the thread blocked in are prepared here:
    /// from the head anchor up to the previous lowest active slot.
    pub fn complete_stack_reference_map(
        &mut self,
        walker: &mut StackFrameWalker<'_>,
        thread: &mut ThreadContext,
        oracle: &dyn ReferenceOracle,
    ) -> Result<()> {
        if self.ignore_current_frame {
            return Err(Error::IgnoredFrameWhileCompleting);
        }
        let head = thread.last_anchor();
        let anchor = if head.is_zero() {
            FrameAnchor::default()
        } else {
            FrameAnchor::read(walker.memory(), head)?
        };
        if anchor.pc.is_zero() {
            error!(
                thread = thread.id(),
                "a thread in managed code at a safepoint should be blocked in native code"
            );
            return Err(Error::ThreadNotStopped);
        }

        let bias = walker.platform().stack_bias;
        let highest = thread.lowest_active_slot();
        let lowest_active = bias.unbias_sp(anchor.sp);
        thread.set_lowest_active_slot(lowest_active);

        // The window may be empty if the thread blocked right at the trap.
        let window_top = highest.minus(WORD_SIZE);
        if lowest_active <= window_top {
            thread.reference_map_mut().clear_range(lowest_active, window_top)?;
        }
        if self.log_scan() {
            debug!(
                thread = thread.id(),
                %highest,
                sp = %lowest_active,
                "complete stack reference map"
            );
        }

        self.completing_limit = highest;
        let thread_id = thread.id();
        let memory = walker.memory();
        let mut pass = PreparationPass {
            preparer: self,
            map: thread.reference_map_mut(),
            memory,
            oracle,
            bias,
            thread_id,
            safepoint: 0,
        };
        let result = walker.prepare_reference_map(anchor.pc, anchor.sp, anchor.fp, head, &mut pass);
        self.completing_limit = Addr::ZERO;
        result
    }

    /// Walks the stack of `thread` from (`ip`, `sp`, `fp`) checking every
    /// frame's reference map against the values in its slots.
    ///
    /// Only verifies if this preparer was created with verification on;
    /// writes bits only if it was created to prepare too.
    pub fn verify_reference_maps(
        &mut self,
        walker: &mut StackFrameWalker<'_>,
        thread: &mut ThreadContext,
        oracle: &dyn ReferenceOracle,
        ip: Addr,
        sp: Addr,
        fp: Addr,
    ) -> Result<()> {
        self.start_scan(thread, walker.platform().stack_bias.unbias_sp(sp));
        let bias = walker.platform().stack_bias;
        let anchor = thread.last_anchor();
        let thread_id = thread.id();
        let memory = walker.memory();
        let mut pass = PreparationPass {
            preparer: self,
            map: thread.reference_map_mut(),
            memory,
            oracle,
            bias,
            thread_id,
            safepoint: 0,
        };
        walker.prepare_reference_map(ip, sp, fp, anchor, &mut pass)
    }
}

/// Registers hold references only while a trap is being handled; every
/// other preparation starts with no spill slot marked.
fn clear_spill_area(thread: &mut ThreadContext) -> Result<()> {
    match thread.spill_area() {
        Some((low, high)) => thread.reference_map_mut().clear_range(low, high),
        None => Ok(()),
    }
}

/// One preparation walk over one thread's stack: what a frame needs to
/// contribute its reference map bits.
pub struct PreparationPass<'a> {
    preparer: &'a mut StackReferenceMapPreparer,
    map: &'a mut ReferenceMap,
    memory: &'a dyn StackMemory,
    oracle: &'a dyn ReferenceOracle,
    bias: StackBias,
    thread_id: u32,
    /// Index of the safepoint of the frame being prepared.
    safepoint: usize,
}

impl PreparationPass<'_> {
    /// Returns whether the frame about to be prepared is skipped. Only the
    /// first frame of a walk can be.
    pub fn check_ignore_current_frame(&mut self) -> bool {
        core::mem::take(&mut self.preparer.ignore_current_frame)
    }

    /// The lowest slot already prepared when completing a map, zero otherwise.
    pub fn completing_limit(&self) -> Addr {
        self.preparer.completing_limit
    }

    pub fn bias(&self) -> StackBias {
        self.bias
    }

    /// Records the start of a frame's preparation.
    pub fn log_prepare(&mut self, method: &str, safepoint: usize, frame_pointer: Addr) {
        self.safepoint = safepoint;
        self.preparer.stats.frames_prepared += 1;
        if self.preparer.log_scan() {
            debug!(
                thread = self.thread_id,
                method,
                safepoint,
                fp = %frame_pointer,
                prepare = self.preparer.prepare,
                "prepare frame reference map"
            );
        }
    }

    /// Applies up to 32 bits of a frame's reference map, bit 0 describing the
    /// slot at `slot_pointer`.
    pub fn visit_reference_map_bits(
        &mut self,
        cursor: &StackFrameCursor<'_>,
        slot_pointer: Addr,
        bits: u32,
        count: u32,
    ) -> Result<()> {
        let sp = self.bias.unbias_sp(cursor.sp());
        if self.preparer.log_scan() {
            trace!(
                %sp,
                fp = %cursor.fp(),
                slots = %slot_pointer,
                bits,
                count,
                method = cursor.target_method().map(|tm| tm.region_name()),
                "set reference map bits"
            );
        }
        if sp < self.map.lowest_slot() {
            return Err(Error::SlotNotInStack { slot: sp });
        }
        if slot_pointer < self.map.lowest_slot() {
            return Err(Error::SlotNotInStack { slot: slot_pointer });
        }
        if bits == 0 {
            return Ok(());
        }
        if count > u32::BITS || (count < u32::BITS && bits >> count != 0) {
            error!(bits, count, "reference map has extraneous high order bits set");
            return Err(Error::ExtraneousBits { bits, count });
        }

        if self.preparer.verify {
            self.verify_bits(cursor, slot_pointer, bits, count)?;
        }
        if self.preparer.prepare {
            self.map.set_bits(self.map.bit_index(slot_pointer), bits, count)?;
            self.preparer.stats.bits_set += bits.count_ones() as usize;
        }
        Ok(())
    }

    fn verify_bits(
        &self,
        cursor: &StackFrameCursor<'_>,
        slot_pointer: Addr,
        bits: u32,
        count: u32,
    ) -> Result<()> {
        for i in (0..count as usize).filter(|i| (bits >> i) & 1 != 0) {
            let slot = slot_pointer.plus_words(i);
            let value = self.memory.read_word(slot)?;
            if self.oracle.is_valid_ref(value) {
                trace!(%slot, value, tagged = self.oracle.is_tagged(value), "reference");
                continue;
            }
            error!(
                scan = self.preparer.scan_count,
                thread = self.thread_id,
                %slot,
                value,
                method = cursor.target_method().map(|tm| tm.region_name()),
                ip = %cursor.ip(),
                safepoint = self.safepoint,
                "invalid ref"
            );
            return Err(Error::InvalidReference {
                slot,
                value,
                safepoint: self.safepoint,
            });
        }
        Ok(())
    }
}
