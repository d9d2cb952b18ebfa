//! Stack walking and stack reference map preparation for a managed runtime.
//!
//! A [`walk::StackFrameWalker`] iterates over the frames of one thread's stack,
//! crossing between managed and native code through the thread's chain of
//! [frame anchors](anchor). The same walk serves four purposes: exception
//! unwinding, reference map preparation for the garbage collector, and raw or
//! typed inspection.
//!
//! Everything on the reference map and unwinding paths is allocation free, as
//! those run while a collection is already in progress.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

use core::fmt;

mod stdext;

pub mod anchor;
pub mod arch;
pub mod bias;
pub mod code;
mod error;
mod identify;
pub mod inspect;
pub mod layout;
pub mod memory;
pub mod options;
pub mod preparer;
pub mod refmap;
pub mod sim;
pub mod thread;
pub mod unwind;
pub mod walk;

pub use error::{Error, RangeViolation, Result};
pub use stdext::{fatal, OrHalt};

/// The size of a machine word (and of one reference map slot) in bytes.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// An address in the (possibly remote) address space of the walked thread.
///
/// This is a plain integer rather than a pointer: the inspector walks stacks
/// of another process, and the GC walks stacks it must not dereference
/// except through [`memory::StackMemory`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr(pub usize);

impl Addr {
    pub const ZERO: Addr = Addr(0);

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn plus(self, bytes: usize) -> Addr {
        Addr(self.0.wrapping_add(bytes))
    }

    pub const fn minus(self, bytes: usize) -> Addr {
        Addr(self.0.wrapping_sub(bytes))
    }

    pub const fn plus_words(self, words: usize) -> Addr {
        self.plus(words * WORD_SIZE)
    }

    pub const fn minus_words(self, words: usize) -> Addr {
        self.minus(words * WORD_SIZE)
    }

    /// Number of bytes from `base` up to `self`. `self` must not be below `base`.
    pub const fn offset_from(self, base: Addr) -> usize {
        self.0 - base.0
    }

    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value)
    }
}
