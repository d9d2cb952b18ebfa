//! Frame anchors: the records that let a walk cross native code.
//!
//! An anchor is four words written into the frame of a native stub on every
//! managed to native call (an exit anchor), or into the frame of a VM entry
//! point on every native to managed call (an entry anchor, whose `pc` is
//! zero). The head of the chain is held per thread; each anchor links to the
//! one written before it, and exit and entry anchors strictly alternate.

use crate::memory::StackMemory;
use crate::{Addr, Result, WORD_SIZE};

/// Number of words in an anchor.
pub const ANCHOR_WORDS: usize = 4;

/// The fields of an anchor, in stack order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorField {
    Previous = 0,
    Pc = 1,
    Sp = 2,
    Fp = 3,
}

impl AnchorField {
    pub const fn offset(self) -> usize {
        self as usize * WORD_SIZE
    }

    pub fn get(self, memory: &dyn StackMemory, anchor: Addr) -> Result<Addr> {
        memory.read_addr(anchor.plus(self.offset()))
    }
}

/// An anchor's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameAnchor {
    pub previous: Addr,
    /// The native call site in the stub, or zero for an entry anchor.
    pub pc: Addr,
    pub sp: Addr,
    pub fp: Addr,
}

impl FrameAnchor {
    pub fn read(memory: &dyn StackMemory, anchor: Addr) -> Result<Self> {
        Ok(Self {
            previous: AnchorField::Previous.get(memory, anchor)?,
            pc: AnchorField::Pc.get(memory, anchor)?,
            sp: AnchorField::Sp.get(memory, anchor)?,
            fp: AnchorField::Fp.get(memory, anchor)?,
        })
    }

    /// An anchor recording a transition into managed code.
    pub fn is_vm_entry(&self) -> bool {
        self.pc.is_zero()
    }

    /// The anchor as it is laid out on the stack.
    pub fn to_words(&self) -> [usize; ANCHOR_WORDS] {
        let mut words = [0; ANCHOR_WORDS];
        words[AnchorField::Previous as usize] = self.previous.addr();
        words[AnchorField::Pc as usize] = self.pc.addr();
        words[AnchorField::Sp as usize] = self.sp.addr();
        words[AnchorField::Fp as usize] = self.fp.addr();
        words
    }
}

/// Whether a thread whose chain starts at `head` is executing managed code.
///
/// A thread with no anchor at all has not entered the VM yet (or has left
/// it for good) and counts as being in managed code: it has nothing to scan.
pub fn in_java(memory: &dyn StackMemory, head: Addr) -> Result<bool> {
    if head.is_zero() {
        return Ok(true);
    }
    Ok(AnchorField::Pc.get(memory, head)?.is_zero())
}
