//! # Errors and the assert hook
//!
//! Two classes of failure exist in the kernel:
//!
//! - **Recoverable** conditions (a take timed out, a stream is full, a
//!   counter would overflow) are returned in-band as [`KernelError`].
//! - **Contract violations** (releasing a mutex you do not own, registering
//!   a name twice, exhausting the object table) halt the system through
//!   [`fatal`]. Resuming past a corrupted invariant is worse than stopping
//!   with the machine state intact for a debugger.

use core::fmt;

/// Recoverable kernel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A take or wait exceeded its deadline (or was non-blocking and the
    /// resource was unavailable).
    Timeout,
    /// A bounded container has no room left.
    Full,
    /// A counter would exceed its maximum value.
    Overflow,
    /// No object is registered under the given key or handle.
    NotFound,
    /// A buffer does not match the size of the database slot.
    InvalidSize,
    /// The object is not in a state that allows the operation.
    InvalidState,
    /// The key does not fit in `KEY_LEN` bytes.
    NameTooLong,
    /// The database heap cannot satisfy the allocation.
    NoMemory,
    /// The object was deleted while the caller waited on it.
    Detached,
    /// The key names an object of a different kind or attribute.
    WrongKind,
    /// The wait was cut short by an explicit `resume`.
    Interrupted,
    /// The database key is private to another task.
    NotOwner,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::Timeout => "timed out",
            KernelError::Full => "no space left",
            KernelError::Overflow => "counter overflow",
            KernelError::NotFound => "object not found",
            KernelError::InvalidSize => "buffer size does not match the slot",
            KernelError::InvalidState => "object is in the wrong state",
            KernelError::NameTooLong => "key is too long",
            KernelError::NoMemory => "heap exhausted",
            KernelError::Detached => "object deleted while waiting",
            KernelError::WrongKind => "object has a different kind",
            KernelError::Interrupted => "wait interrupted by resume",
            KernelError::NotOwner => "key is owned by another task",
        };
        f.write_str(msg)
    }
}

/// Convenience alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;

/// Halt on a violated kernel invariant.
///
/// On the target this masks interrupts and spins so the failing context
/// can be inspected with a debugger. Host builds panic instead, which lets
/// tests observe the failure.
#[cold]
#[inline(never)]
pub fn fatal(msg: &str, file: &'static str, line: u32) -> ! {
    log::error!("kernel assertion failed at {}:{}: {}", file, line, msg);
    halt(msg, file, line)
}

#[cfg(target_arch = "arm")]
fn halt(_msg: &str, _file: &'static str, _line: u32) -> ! {
    cortex_m::interrupt::disable();
    loop {
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(not(target_arch = "arm"))]
fn halt(msg: &str, file: &'static str, line: u32) -> ! {
    panic!("kernel assertion failed at {}:{}: {}", file, line, msg)
}

/// Assert a kernel invariant, halting through [`fatal`] when it does not
/// hold. Enabled in every build profile.
#[macro_export]
macro_rules! kernel_assert {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::error::fatal($msg, file!(), line!());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(KernelError::Timeout.to_string(), "timed out");
        assert_eq!(KernelError::Full.to_string(), "no space left");
    }

    #[test]
    #[should_panic(expected = "kernel assertion failed")]
    fn test_kernel_assert_halts() {
        kernel_assert!(1 + 1 == 3, "arithmetic is broken");
    }
}
