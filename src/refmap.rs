//! The per-thread stack reference map.
//!
//! One bit per stack word, from the lowest stack slot (the start of the
//! thread's register spill area) to the highest stack slot. Bit `i` of the map
//! describes the word at `lowest_slot + i * WORD_SIZE`; bit `i` lives in byte
//! `i / 8` at bit position `i % 8`.
//!
//! The collector scans this map instead of walking frames, so a pause needs
//! no allocation and no object traversal to find stack roots.


use alloc::vec;
use alloc::vec::Vec;

use crate::memory::StackMemory;
use crate::{Addr, Error, RangeViolation, Result, WORD_SIZE};

const BYTE_BITS: usize = 8;

/// What the heap can tell the stack scanner about a word.
pub trait ReferenceOracle {
    /// Whether `value` plausibly refers to an object (or is null).
    fn is_valid_ref(&self, value: usize) -> bool;

    /// Whether `value` is a tagged small value rather than a pointer. Tagged
    /// values are never relocated and are skipped by root scanning.
    fn is_tagged(&self, _value: usize) -> bool {
        false
    }
}

/// A heap occupying one address range, with low-bit tagging of small values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBounds {
    pub start: Addr,
    pub end: Addr,
    /// Values with any of these bits set are tagged.
    pub tag_mask: usize,
}

impl ReferenceOracle for HeapBounds {
    fn is_valid_ref(&self, value: usize) -> bool {
        if value == 0 {
            return true;
        }
        !self.is_tagged(value)
            && value >= self.start.addr()
            && value < self.end.addr()
            && value % WORD_SIZE == 0
    }

    fn is_tagged(&self, value: usize) -> bool {
        value & self.tag_mask != 0
    }
}

/// The reference map of one thread's stack.
///
/// Allocated once when the thread is created. Clearing, setting and
/// scanning never allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMap {
    lowest_slot: Addr,
    highest_slot: Addr,
    bytes: Vec<u8>,
}

impl ReferenceMap {
    /// A cleared map covering `[lowest_slot, highest_slot]`, both word aligned.
    pub fn new(lowest_slot: Addr, highest_slot: Addr) -> Self {
        debug_assert!(lowest_slot.is_word_aligned() && highest_slot.is_word_aligned());
        debug_assert!(lowest_slot <= highest_slot);
        let slots = highest_slot.offset_from(lowest_slot) / WORD_SIZE + 1;
        Self {
            lowest_slot,
            highest_slot,
            bytes: vec![0; slots.div_ceil(BYTE_BITS)],
        }
    }

    pub fn lowest_slot(&self) -> Addr {
        self.lowest_slot
    }

    pub fn highest_slot(&self) -> Addr {
        self.highest_slot
    }

    /// Number of slots covered.
    pub fn slots(&self) -> usize {
        self.highest_slot.offset_from(self.lowest_slot) / WORD_SIZE + 1
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn contains(&self, slot: Addr) -> bool {
        slot >= self.lowest_slot && slot <= self.highest_slot
    }

    pub fn bit_index(&self, slot: Addr) -> usize {
        slot.offset_from(self.lowest_slot) / WORD_SIZE
    }

    pub fn slot_address(&self, bit_index: usize) -> Addr {
        self.lowest_slot.plus_words(bit_index)
    }

    pub fn is_set(&self, bit_index: usize) -> bool {
        self.bytes
            .get(bit_index / BYTE_BITS)
            .is_some_and(|byte| (byte >> (bit_index % BYTE_BITS)) & 1 != 0)
    }

    pub fn is_slot_set(&self, slot: Addr) -> bool {
        self.contains(slot) && self.is_set(self.bit_index(slot))
    }

    pub fn check_range(&self, low: Addr, high: Addr) -> Result<()> {
        let violation = if high < low {
            RangeViolation::Inverted
        } else if high > self.highest_slot {
            RangeViolation::AboveHighestSlot
        } else if low < self.lowest_slot {
            RangeViolation::BelowLowestSlot
        } else {
            return Ok(());
        };
        Err(Error::InvalidRange {
            low,
            high,
            violation,
        })
    }

    /// Zeroes the bits for the slots in `[low, high]`. Bits of slots outside
    /// the range that share a byte with its ends are preserved.
    pub fn clear_range(&mut self, low: Addr, high: Addr) -> Result<()> {
        self.check_range(low, high)?;
        let lowest_bit = self.bit_index(low);
        let highest_bit = self.bit_index(high);
        let lowest_byte = lowest_bit / BYTE_BITS;
        let highest_byte = highest_bit / BYTE_BITS;

        // Bits below `lowest_bit` in its byte, and above `highest_bit` in its byte.
        let lowest_preserved = low_bits_set(lowest_bit % BYTE_BITS);
        let highest_preserved = !low_bits_set(highest_bit % BYTE_BITS + 1);

        if lowest_byte == highest_byte {
            self.bytes[lowest_byte] &= lowest_preserved | highest_preserved;
        } else {
            self.bytes[lowest_byte] &= lowest_preserved;
            self.bytes[highest_byte] &= highest_preserved;
            self.bytes[lowest_byte + 1..highest_byte].fill(0);
        }

        debug!(lowest_bit, highest_bit, "cleared reference map bits");
        Ok(())
    }

    pub fn set_bit(&mut self, bit_index: usize) -> Result<()> {
        let Some(byte) = self.bytes.get_mut(bit_index / BYTE_BITS) else {
            return Err(Error::SlotNotInStack {
                slot: self.lowest_slot.plus_words(bit_index),
            });
        };
        *byte |= 1 << (bit_index % BYTE_BITS);
        Ok(())
    }

    /// ORs `count` bits (at most 32) into the map, bit 0 of `bits` going to
    /// `base_index`. Bits set at or above `count` are an error, never masked.
    pub fn set_bits(&mut self, base_index: usize, bits: u32, count: u32) -> Result<()> {
        if count > u32::BITS || (count < u32::BITS && bits >> count != 0) {
            return Err(Error::ExtraneousBits { bits, count });
        }
        let end = base_index + count as usize;
        if end > self.slots() {
            return Err(Error::SlotNotInStack {
                slot: self.slot_address(end - 1),
            });
        }
        if bits == 0 {
            return Ok(());
        }

        let mut map_bits = bits;
        let mut slot_index = base_index;
        while slot_index < end {
            // Shift into position within the byte, take what fits, carry the rest.
            let rest = slot_index % BYTE_BITS;
            let taken = BYTE_BITS - rest;
            self.bytes[slot_index / BYTE_BITS] |= (map_bits << rest) as u8;
            slot_index += taken;
            map_bits = map_bits.checked_shr(taken as u32).unwrap_or(0);
        }
        Ok(())
    }

    /// Calls `f` with the index of every set bit for a slot in `[low, high]`.
    pub fn for_each_set_bit(
        &self,
        low: Addr,
        high: Addr,
        mut f: impl FnMut(usize) -> Result<()>,
    ) -> Result<()> {
        self.check_range(low, high)?;
        let lowest_bit = self.bit_index(low);
        let highest_bit = self.bit_index(high);

        for byte_index in lowest_bit / BYTE_BITS..=highest_bit / BYTE_BITS {
            let byte = self.bytes[byte_index];
            if byte == 0 {
                continue;
            }
            let base = byte_index * BYTE_BITS;
            let start = lowest_bit.max(base) - base;
            let end = (highest_bit + 1).min(base + BYTE_BITS) - base;
            for bit in start..end {
                if (byte >> bit) & 1 != 0 {
                    f(base + bit)?;
                }
            }
        }
        Ok(())
    }

    /// Visits the address of every slot in `[low, high]` whose bit is set,
    /// skipping slots that currently hold a tagged value.
    pub fn scan_range(
        &self,
        low: Addr,
        high: Addr,
        memory: &dyn StackMemory,
        oracle: &dyn ReferenceOracle,
        mut visitor: impl FnMut(Addr),
    ) -> Result<()> {
        self.for_each_set_bit(low, high, |bit_index| {
            let slot = self.slot_address(bit_index);
            let value = memory.read_word(slot)?;
            trace!(%slot, value, bit_index, "stack root");
            if !oracle.is_tagged(value) {
                visitor(slot);
            }
            Ok(())
        })
    }
}

/// A byte with the lowest `n` bits set, `n <= 8`.
fn low_bits_set(n: usize) -> u8 {
    ((1u16 << n) - 1) as u8
}
