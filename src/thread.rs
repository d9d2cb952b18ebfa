//! Per-thread walking state.
//!
//! The stack of a VM thread, from low to high addresses:
//!
//! ```text
//! lowest_stack_slot   register spill area (spill_slots words)
//!                     ... free stack ...
//! lowest_active_slot  stack pointer when the map was last prepared
//!                     ... active frames ...
//! highest_stack_slot  top of the allocated stack
//! ```
//!
//! The reference map covers all of it, so one bit index scheme serves both
//! the spill area and the frames.

use crate::anchor::FrameAnchor;
use crate::bias::StackBias;
use crate::memory::StackMemory;
use crate::refmap::{ReferenceMap, ReferenceOracle};
use crate::{Addr, Error, Result};

/// Registers of a thread stopped by a trap, as the trap handler saved them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapState {
    pub pc: Addr,
    pub sp: Addr,
    pub fp: Addr,
    /// Bit `i` set if register `i`, saved in spill slot `i`, holds a reference.
    pub register_refs: u32,
}

#[derive(Debug, Clone)]
pub struct ThreadContext {
    id: u32,
    lowest_stack_slot: Addr,
    spill_slots: usize,
    highest_stack_slot: Addr,
    lowest_active_slot: Addr,
    last_anchor: Addr,
    stack_bias: StackBias,
    reference_map: ReferenceMap,
}

impl ThreadContext {
    /// A thread whose map covers `[lowest_stack_slot, highest_stack_slot]`.
    /// The first `spill_slots` words are the register spill area.
    pub fn new(id: u32, lowest_stack_slot: Addr, spill_slots: usize, highest_stack_slot: Addr) -> Self {
        Self {
            id,
            lowest_stack_slot,
            spill_slots,
            highest_stack_slot,
            lowest_active_slot: highest_stack_slot,
            last_anchor: Addr::ZERO,
            stack_bias: StackBias::NONE,
            reference_map: ReferenceMap::new(lowest_stack_slot, highest_stack_slot),
        }
    }

    /// The bias of the stack pointers recorded in this thread's anchors.
    pub fn with_stack_bias(mut self, stack_bias: StackBias) -> Self {
        self.stack_bias = stack_bias;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn lowest_stack_slot(&self) -> Addr {
        self.lowest_stack_slot
    }

    pub fn highest_stack_slot(&self) -> Addr {
        self.highest_stack_slot
    }

    /// The lowest slot covered by the last preparation.
    pub fn lowest_active_slot(&self) -> Addr {
        self.lowest_active_slot
    }

    pub(crate) fn set_lowest_active_slot(&mut self, slot: Addr) {
        self.lowest_active_slot = slot;
    }

    /// Head of the thread's anchor chain, zero if the thread has no managed
    /// frames.
    pub fn last_anchor(&self) -> Addr {
        self.last_anchor
    }

    pub fn set_last_anchor(&mut self, anchor: Addr) {
        self.last_anchor = anchor;
    }

    pub fn spill_slots(&self) -> usize {
        self.spill_slots
    }

    /// First and last word of the register spill area.
    pub fn spill_area(&self) -> Option<(Addr, Addr)> {
        (self.spill_slots > 0).then(|| {
            (
                self.lowest_stack_slot,
                self.lowest_stack_slot.plus_words(self.spill_slots - 1),
            )
        })
    }

    pub fn reference_map(&self) -> &ReferenceMap {
        &self.reference_map
    }

    pub(crate) fn reference_map_mut(&mut self) -> &mut ReferenceMap {
        &mut self.reference_map
    }

    /// Visits every stack root: the marked slots of the register spill area
    /// and, for a thread with managed frames, of the active stack.
    pub fn scan_references(
        &self,
        memory: &dyn StackMemory,
        oracle: &dyn ReferenceOracle,
        mut visitor: impl FnMut(Addr),
    ) -> Result<()> {
        if let Some((low, high)) = self.spill_area() {
            self.reference_map
                .scan_range(low, high, memory, oracle, &mut visitor)?;
        }

        if self.last_anchor.is_zero() {
            // No managed frames, nothing on the stack to scan.
            return Ok(());
        }
        let anchor = FrameAnchor::read(memory, self.last_anchor)?;
        let sp = self.stack_bias.unbias_sp(anchor.sp);
        // Only a thread stopped in native code has frames the anchor vouches for.
        if !anchor.is_vm_entry() && sp < self.lowest_active_slot {
            error!(
                thread = self.id,
                %sp,
                lowest_active = %self.lowest_active_slot,
                "stack reference map does not cover all active slots"
            );
            return Err(Error::UncoveredSlots {
                sp,
                lowest_active: self.lowest_active_slot,
            });
        }

        debug!(
            thread = self.id,
            lowest_active = %self.lowest_active_slot,
            highest = %self.highest_stack_slot,
            "scanning thread stack"
        );
        self.reference_map.scan_range(
            self.lowest_active_slot,
            self.highest_stack_slot,
            memory,
            oracle,
            visitor,
        )
    }
}
