use core::fmt;
use core::fmt::Write;

use crate::Error;

/// Writes straight to stderr. Does not allocate and does not need a tracing
/// subscriber, so it still works while the VM is going down.
pub struct LibCStderrWriter;

impl Write for LibCStderrWriter {
    fn write_str(&mut self, mut s: &str) -> fmt::Result {
        loop {
            let r = unsafe { libc::write(libc::STDERR_FILENO, s.as_ptr().cast(), s.len()) };
            if r < 0 {
                return Err(fmt::Error);
            }
            if r == 0 {
                return Ok(());
            }
            s = &s[(r as usize)..];
        }
    }
}

pub fn eprint(args: fmt::Arguments<'_>) -> fmt::Result {
    write!(LibCStderrWriter, "{}", args)
}

pub(crate) fn abort() -> ! {
    // SAFETY: We abort.
    unsafe { libc::abort() };
}

/// Halts the VM on a structural stack error.
///
/// There is no recovery from a corrupt stack: unwinding or scanning past it
/// would hand the collector garbage as roots.
#[cold]
pub fn fatal(error: Error) -> ! {
    error!(%error, "fatal stack walk error");
    // Nothing left to report to if stderr is gone.
    let _ = eprint(format_args!("FATAL ERROR: {error}\n"));
    abort()
}

/// Turns a stack walk [`Error`] into a VM halt. This is what the collector and
/// the exception dispatcher use at their boundary.
pub trait OrHalt<T> {
    fn or_halt(self) -> T;
}

impl<T> OrHalt<T> for Result<T, Error> {
    fn or_halt(self) -> T {
        match self {
            Ok(value) => value,
            Err(error) => fatal(error),
        }
    }
}
