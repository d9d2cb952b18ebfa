use crate::bias::StackBias;
use crate::Addr;

/// The properties of the target ISA and ABI that the walker depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Whether a return address points after the call instruction (x86,
    /// AArch64) rather than at it (SPARC).
    pub return_address_after_call: bool,
    pub stack_bias: StackBias,
}

impl Platform {
    /// The platform this VM was built for.
    pub const fn host() -> Platform {
        if cfg!(target_arch = "sparc64") {
            Platform {
                return_address_after_call: false,
                stack_bias: StackBias::SPARC_V9,
            }
        } else {
            Platform {
                return_address_after_call: true,
                stack_bias: StackBias::NONE,
            }
        }
    }

    /// The address used to look up the method containing a return address.
    ///
    /// If the return address points after the call, step back one byte so the
    /// lookup stays inside the call instruction, even when the call is the
    /// last instruction of a method.
    pub const fn call_site_of(&self, return_address: Addr) -> Addr {
        if self.return_address_after_call {
            return_address.minus(1)
        } else {
            return_address
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::host()
    }
}
