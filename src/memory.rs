//! Word-granular access to a thread's stack memory.
//!
//! All stack reads go through [`StackMemory`]; the only raw memory access in
//! the crate is behind [`StackRegion::from_raw`].

use core::slice;

use crate::{Addr, Error, Result, WORD_SIZE};

/// Reads words out of a thread's stack.
///
/// The in-process implementation is [`StackRegion`]. An inspector running in
/// another process implements this over its own remote memory reader.
pub trait StackMemory {
    /// Reads the word at `addr`, which must be word aligned.
    fn read_word(&self, addr: Addr) -> Result<usize>;

    fn read_addr(&self, addr: Addr) -> Result<Addr> {
        self.read_word(addr).map(Addr)
    }
}

/// A contiguous, word-aligned range of stack memory.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion<'a> {
    base: Addr,
    words: &'a [usize],
}

impl<'a> StackRegion<'a> {
    /// A region whose lowest word is `words[0]`, located at `base`.
    pub fn new(base: Addr, words: &'a [usize]) -> Self {
        debug_assert!(base.is_word_aligned());
        Self { base, words }
    }

    /// A region over live memory of the current process.
    ///
    /// # Safety
    /// `[base, base + len * WORD_SIZE)` must be readable for `'a` and must not
    /// be written through any other path while the region is read.
    pub unsafe fn from_raw(base: *const usize, len: usize) -> Self {
        Self {
            base: Addr(base as usize),
            words: slice::from_raw_parts(base, len),
        }
    }

    pub fn base(&self) -> Addr {
        self.base
    }

    /// The address just past the last word of the region.
    pub fn end(&self) -> Addr {
        self.base.plus_words(self.words.len())
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn index_of(&self, addr: Addr) -> Option<usize> {
        if !addr.is_word_aligned() || !self.contains(addr) {
            return None;
        }
        Some(addr.offset_from(self.base) / WORD_SIZE)
    }
}

impl StackMemory for StackRegion<'_> {
    fn read_word(&self, addr: Addr) -> Result<usize> {
        self.index_of(addr)
            .map(|index| self.words[index])
            .ok_or(Error::UnmappedAddress { addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_bounds_checked() {
        let words = [1, 2, 3];
        let region = StackRegion::new(Addr(0x1000), &words);

        assert_eq!(region.read_word(Addr(0x1000)), Ok(1));
        assert_eq!(region.read_word(Addr(0x1000).plus_words(2)), Ok(3));
        assert_eq!(
            region.read_word(Addr(0x1000).plus_words(3)),
            Err(Error::UnmappedAddress {
                addr: Addr(0x1000).plus_words(3)
            })
        );
        assert!(region.read_word(Addr(0x1001)).is_err());
        assert!(region.read_word(Addr(0x0ff8)).is_err());
    }
}
