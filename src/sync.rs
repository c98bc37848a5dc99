//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions. All shared kernel state
//! (ready bitmap, timer list, object table, task control blocks) is mutated
//! only inside a critical section; this is a uniprocessor design and the
//! critical section is the one global lock.
//!
//! On the target the implementation comes from `cortex-m`'s single-core
//! `critical-section` provider (PRIMASK). Host test builds use the
//! `critical-section/std` provider.

use core::marker::PhantomData;

use critical_section::RestoreState;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are disabled on entry and restored on exit, ensuring
/// atomicity of the enclosed operation.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(critical_section::CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Scoped critical section.
///
/// Masks interrupts on construction and restores the previous mask state
/// when dropped, so every exit path of the enclosing scope (including `?`
/// and early returns) leaves the critical section. Guards nest.
pub struct Critical {
    restore: RestoreState,
    _not_send: PhantomData<*const ()>,
}

impl Critical {
    /// Enter a critical section.
    #[inline]
    pub fn enter() -> Self {
        // SAFETY: the matching release happens in `Drop`, and guards are
        // not `Send`, so acquire/release pairs stay properly nested on the
        // one core.
        let restore = unsafe { critical_section::acquire() };
        Self {
            restore,
            _not_send: PhantomData,
        }
    }

    /// Borrow a token proving interrupts are masked.
    #[inline]
    pub fn token(&self) -> critical_section::CriticalSection<'_> {
        // SAFETY: the token cannot outlive `self`, which holds the section.
        unsafe { critical_section::CriticalSection::new() }
    }
}

impl Drop for Critical {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: `restore` came from the acquire in `enter`.
        unsafe { critical_section::release(self.restore) }
    }
}

/// Port hook: mask interrupts, returning a guard that restores them.
///
/// The kernel itself uses [`Critical`] directly. This pair is the
/// interface offered to collaborators outside the kernel (device
/// framework, drivers) so they never touch PRIMASK themselves.
#[inline]
pub fn irq_disable() -> Critical {
    Critical::enter()
}

/// Port hook: restore the interrupt state captured by [`irq_disable`].
#[inline]
pub fn irq_enable(guard: Critical) {
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_nesting() {
        let outer = Critical::enter();
        {
            let _inner = Critical::enter();
        }
        let value = critical_section(|_cs| 7);
        irq_enable(outer);
        assert_eq!(value, 7);
    }

    #[test]
    fn test_early_return_releases() {
        fn fallible(fail: bool) -> Result<u32, ()> {
            let _guard = irq_disable();
            if fail {
                return Err(());
            }
            Ok(1)
        }
        assert!(fallible(true).is_err());
        assert_eq!(fallible(false), Ok(1));
        // A leaked section would deadlock the std provider here.
        assert_eq!(critical_section(|_| 2), 2);
    }
}
