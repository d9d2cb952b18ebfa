//! Frame layout of a compiled method: where locals and operand stack slots
//! live relative to the frame's slot base, and which reference map bit each
//! one corresponds to.
//!
//! The slot area starts at the (unbiased) frame pointer. Locals come first,
//! parameters being the lowest-numbered locals, followed by the operand
//! stack. A logical slot may span several machine words when the platform
//! aligns slots more strictly than words; the value is held in the first word
//! of the slot and the rest of the slot is filler.

use crate::{Error, Result, WORD_SIZE};

/// What a word of a frame's slot area holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotName {
    Local(usize),
    Operand(usize),
    /// Padding inside a logical slot. Never holds a reference.
    Filler { slot_of: SlotKind, index: usize },
    /// Beyond the slot area.
    OutsideSlots,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Local,
    Operand,
}

/// Immutable per-method frame layout, created once when the method is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    locals: usize,
    operands: usize,
    parameters: usize,
    slot_size: usize,
}

impl FrameLayout {
    /// A layout with one machine word per slot.
    pub fn new(locals: usize, operands: usize, parameters: usize) -> Result<Self> {
        Self::with_slot_size(locals, operands, parameters, WORD_SIZE)
    }

    /// A layout whose logical slots are `slot_size` bytes. `slot_size` must be
    /// a non-zero multiple of the word size.
    pub fn with_slot_size(
        locals: usize,
        operands: usize,
        parameters: usize,
        slot_size: usize,
    ) -> Result<Self> {
        if locals < parameters || slot_size == 0 || slot_size % WORD_SIZE != 0 {
            return Err(Error::InvalidFrameLayout);
        }
        Ok(Self {
            locals,
            operands,
            parameters,
            slot_size,
        })
    }

    pub fn number_of_local_slots(&self) -> usize {
        self.locals
    }

    pub fn number_of_operand_slots(&self) -> usize {
        self.operands
    }

    pub fn number_of_parameter_slots(&self) -> usize {
        self.parameters
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn words_per_slot(&self) -> usize {
        self.slot_size / WORD_SIZE
    }

    pub fn size_of_locals(&self) -> usize {
        self.locals * self.slot_size
    }

    pub fn size_of_parameters(&self) -> usize {
        self.parameters * self.slot_size
    }

    pub fn size_of_operand_stack(&self) -> usize {
        self.operands * self.slot_size
    }

    /// Size in bytes of the whole slot area.
    pub fn size_of_slots(&self) -> usize {
        self.size_of_locals() + self.size_of_operand_stack()
    }

    /// Number of reference map bits the slot area contributes.
    pub fn reference_map_bits(&self) -> usize {
        self.size_of_slots() / WORD_SIZE
    }

    pub fn local_slot_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.locals);
        index * self.slot_size
    }

    pub fn operand_slot_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.operands);
        self.size_of_locals() + index * self.slot_size
    }

    pub fn local_slot_ref_map_index(&self, index: usize) -> usize {
        self.local_slot_offset(index) / WORD_SIZE
    }

    pub fn operand_slot_ref_map_index(&self, index: usize) -> usize {
        self.operand_slot_offset(index) / WORD_SIZE
    }

    /// Names the word at `word_index` of the slot area.
    pub fn slot_name(&self, word_index: usize) -> SlotName {
        let per_slot = self.words_per_slot();
        let slot = word_index / per_slot;
        let (kind, index) = if slot < self.locals {
            (SlotKind::Local, slot)
        } else if slot < self.locals + self.operands {
            (SlotKind::Operand, slot - self.locals)
        } else {
            return SlotName::OutsideSlots;
        };

        if word_index % per_slot != 0 {
            return SlotName::Filler {
                slot_of: kind,
                index,
            };
        }
        match kind {
            SlotKind::Local => SlotName::Local(index),
            SlotKind::Operand => SlotName::Operand(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_more_parameters_than_locals() {
        assert_eq!(FrameLayout::new(1, 0, 2), Err(Error::InvalidFrameLayout));
        assert_eq!(
            FrameLayout::with_slot_size(2, 0, 1, WORD_SIZE + 1),
            Err(Error::InvalidFrameLayout)
        );
    }

    #[test]
    fn sizes_are_slot_counts_times_slot_size() {
        let layout = FrameLayout::with_slot_size(3, 2, 1, 2 * WORD_SIZE).unwrap();
        assert_eq!(layout.size_of_locals(), 6 * WORD_SIZE);
        assert_eq!(layout.size_of_parameters(), 2 * WORD_SIZE);
        assert_eq!(layout.size_of_operand_stack(), 4 * WORD_SIZE);
        assert_eq!(layout.reference_map_bits(), 10);
    }

    #[test]
    fn operands_follow_locals() {
        let layout = FrameLayout::new(2, 3, 0).unwrap();
        assert_eq!(layout.local_slot_ref_map_index(1), 1);
        assert_eq!(layout.operand_slot_ref_map_index(0), 2);
        assert_eq!(layout.operand_slot_offset(2), 4 * WORD_SIZE);
    }

    #[test]
    fn filler_words_are_named() {
        let layout = FrameLayout::with_slot_size(2, 1, 0, 2 * WORD_SIZE).unwrap();
        assert_eq!(layout.slot_name(0), SlotName::Local(0));
        assert_eq!(
            layout.slot_name(1),
            SlotName::Filler {
                slot_of: SlotKind::Local,
                index: 0
            }
        );
        assert_eq!(layout.slot_name(2), SlotName::Local(1));
        assert_eq!(layout.slot_name(4), SlotName::Operand(0));
        assert_eq!(
            layout.slot_name(5),
            SlotName::Filler {
                slot_of: SlotKind::Operand,
                index: 0
            }
        );
        assert_eq!(layout.slot_name(6), SlotName::OutsideSlots);
        assert_eq!(layout.local_slot_ref_map_index(1), 2);
    }
}
