use core::fmt;

use crate::Addr;

/// Which bound of a reference map range was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeViolation {
    /// The highest slot is less than the lowest slot.
    Inverted,
    /// The highest slot is above the highest stack slot.
    AboveHighestSlot,
    /// The lowest slot is below the lowest stack slot.
    BelowLowestSlot,
}

/// An inconsistent stack shape. Every variant is fatal to the VM: continuing
/// would unwind to, or scan, a wrong set of frames. See [`crate::OrHalt`].
///
/// This type carries no heap data so it can be produced while a collection
/// is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A walk was started on a walker that was not reset after its last walk.
    WalkerInUse,
    /// Two VM entry anchors were found next to each other in the anchor chain.
    AdjacentEntryAnchors { anchor: Addr },
    /// An anchor links to one that is not higher up the stack.
    AnchorChainNotAscending { anchor: Addr, previous: Addr },
    /// The thread is in native code but no native stub anchor remains.
    MissingNativeStubAnchor,
    /// The thread is in native code but its anchor has no recorded caller.
    AnchorWithoutCaller { anchor: Addr },
    /// An anchor's pc is not inside a native stub.
    UnresolvedNativeCall { pc: Addr },
    /// Native code called a method that is not a VM entry point or trap stub.
    NativeCalledNonEntryPoint { callee: Addr },
    /// A VM entry point was called from managed code.
    EntryPointCalledFromManaged { caller: Addr },
    /// A stack address outside the readable region.
    UnmappedAddress { addr: Addr },
    /// A frame is stopped at a position with no reference map.
    MissingSafepoint { method: Addr, pos: usize },
    /// A reference map word has bits set at or above its declared width.
    ExtraneousBits { bits: u32, count: u32 },
    /// A reference map range is outside the thread's stack.
    InvalidRange {
        low: Addr,
        high: Addr,
        violation: RangeViolation,
    },
    /// A slot to be marked is not within this thread's stack.
    SlotNotInStack { slot: Addr },
    /// Verification found a marked slot that does not hold a plausible reference.
    InvalidReference {
        slot: Addr,
        value: usize,
        safepoint: usize,
    },
    /// The thread's anchor shows it is not stopped in native code.
    ThreadNotStopped,
    /// The reference map leaves active stack slots uncovered.
    UncoveredSlots { sp: Addr, lowest_active: Addr },
    /// Completing a reference map must prepare every frame.
    IgnoredFrameWhileCompleting,
    /// A frame layout with fewer locals than parameters, or a bad slot size.
    InvalidFrameLayout,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::WalkerInUse => f.write_str("stack walker already in use"),
            Error::AdjacentEntryAnchors { anchor } => {
                write!(f, "found two adjacent VM entry point frame anchors at {anchor}")
            }
            Error::AnchorChainNotAscending { anchor, previous } => write!(
                f,
                "frame anchor at {anchor} links to {previous}, which is not an older anchor"
            ),
            Error::MissingNativeStubAnchor => {
                f.write_str("no native stub frame anchor found when executing 'in native'")
            }
            Error::AnchorWithoutCaller { anchor } => write!(
                f,
                "thread cannot be 'in native' without a recorded caller (anchor {anchor})"
            ),
            Error::UnresolvedNativeCall { pc } => {
                write!(f, "could not find native function call in native stub for pc {pc}")
            }
            Error::NativeCalledNonEntryPoint { callee } => write!(
                f,
                "native code entered method at {callee} that is not a VM entry point or trap stub"
            ),
            Error::EntryPointCalledFromManaged { caller } => write!(
                f,
                "caller of a VM entry point must be native code, found managed code at {caller}"
            ),
            Error::UnmappedAddress { addr } => write!(f, "stack address {addr} is not mapped"),
            Error::MissingSafepoint { method, pos } => write!(
                f,
                "no reference map for position {pos} in method at {method}"
            ),
            Error::ExtraneousBits { bits, count } => write!(
                f,
                "reference map has extraneous high order bits set: {bits:#x} for {count} slots"
            ),
            Error::InvalidRange {
                low,
                high,
                violation,
            } => {
                let what = match violation {
                    RangeViolation::Inverted => "highest slot is less than lowest slot",
                    RangeViolation::AboveHighestSlot => {
                        "highest slot is greater than highest stack slot"
                    }
                    RangeViolation::BelowLowestSlot => "lowest slot is less than lowest stack slot",
                };
                write!(f, "invalid reference map range [{low}, {high}]: {what}")
            }
            Error::SlotNotInStack { slot } => write!(f, "slot {slot} not in this stack"),
            Error::InvalidReference {
                slot,
                value,
                safepoint,
            } => write!(
                f,
                "invalid ref {value:#x} in slot {slot} at safepoint {safepoint}"
            ),
            Error::ThreadNotStopped => f.write_str("thread is not stopped"),
            Error::UncoveredSlots { sp, lowest_active } => write!(
                f,
                "stack slots between {sp} and {lowest_active} are not covered by the reference map"
            ),
            Error::IgnoredFrameWhileCompleting => {
                f.write_str("all frames should be scanned when completing a stack reference map")
            }
            Error::InvalidFrameLayout => f.write_str("invalid frame layout"),
        }
    }
}
