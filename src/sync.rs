//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections for the scheduler state. The tick and
//! event handlers relink the same queues the foreground fibers do, so every
//! multi-step update runs with interrupts masked.
//!
//! The implementation comes from the `critical-section` crate: on the target
//! it is `cortex-m`'s single-core implementation, on the host the `std` one.

pub use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Nesting is allowed. Keep the closure short and never switch fibers
/// inside it: the masked state would travel with the stack image.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     let mut state = STATE.borrow_ref_mut(cs);
///     // ...
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use critical_section::Mutex;

    #[test]
    fn test_nested_sections() {
        let counter = Mutex::new(Cell::new(0u32));
        critical_section(|outer| {
            counter.borrow(outer).set(1);
            critical_section(|inner| {
                let c = counter.borrow(inner);
                c.set(c.get() + 1);
            });
        });
        assert_eq!(critical_section(|cs| counter.borrow(cs).get()), 2);
    }
}
