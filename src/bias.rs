//! Stack bias: the constant offset some ABIs put between the hardware stack
//! and frame pointer registers and the addresses they denote.
//!
//! On SPARC V9 the `%sp` and `%fp` registers hold the address of the frame
//! minus 2047, so every slot computation must first unbias them.

use crate::Addr;

/// A per-platform stack bias. Fixed for the lifetime of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBias {
    bias: usize,
    stack_pointer_biased: bool,
    frame_pointer_biased: bool,
}

impl StackBias {
    pub const NONE: StackBias = StackBias::new(0, false, false);

    pub const SPARC_V9: StackBias = StackBias::new(2047, true, true);

    /// Code from the baseline compiler on SPARC keeps an unbiased frame pointer.
    pub const JIT_SPARC_V9: StackBias = StackBias::new(2047, true, false);

    const fn new(bias: usize, stack_pointer_biased: bool, frame_pointer_biased: bool) -> Self {
        Self {
            bias,
            stack_pointer_biased,
            frame_pointer_biased,
        }
    }

    pub const fn stack_bias(&self) -> usize {
        self.bias
    }

    pub const fn is_stack_pointer_biased(&self) -> bool {
        self.stack_pointer_biased
    }

    pub const fn is_frame_pointer_biased(&self) -> bool {
        self.frame_pointer_biased
    }

    pub const fn bias(&self, unbiased: Addr) -> Addr {
        unbiased.minus(self.bias)
    }

    pub const fn unbias(&self, biased: Addr) -> Addr {
        biased.plus(self.bias)
    }

    pub const fn bias_sp(&self, sp: Addr) -> Addr {
        if self.stack_pointer_biased {
            self.bias(sp)
        } else {
            sp
        }
    }

    pub const fn unbias_sp(&self, sp: Addr) -> Addr {
        if self.stack_pointer_biased {
            self.unbias(sp)
        } else {
            sp
        }
    }

    pub const fn bias_fp(&self, fp: Addr) -> Addr {
        if self.frame_pointer_biased {
            self.bias(fp)
        } else {
            fp
        }
    }

    pub const fn unbias_fp(&self, fp: Addr) -> Addr {
        if self.frame_pointer_biased {
            self.unbias(fp)
        } else {
            fp
        }
    }
}
