//! # Architecture Abstraction Layer
//!
//! The [`Port`] trait is the only boundary between the scheduler and the
//! processor. Everything that touches registers, the stack pointer or
//! low-power instructions lives behind it, so the scheduler logic above is
//! portable and can be driven on the host by [`sim::SimPort`].
//!
//! ## Stack duplication
//!
//! All fibers execute on the one physical stack whose top is
//! `config::STACK_BASE`. Switching a fiber out copies the live part of that
//! stack, `[sp, STACK_BASE)`, into the fiber's heap buffer (ending at the
//! buffer's top). Switching it in copies the image back to the same
//! addresses before the saved stack pointer is restored.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod sim;

/// First code a freshly primed context runs. Receives the `arg` given to
/// [`Port::prime`] and never returns.
pub type Trampoline = unsafe extern "C" fn(*const ()) -> !;

/// The execution primitive a scheduler runs on.
///
/// Contexts are opaque to the scheduler: it only stores them and hands
/// pointers back to the port.
pub trait Port {
    /// Saved register state of a switched-out fiber.
    type Context;

    /// A context that has never been saved or primed.
    const EMPTY_CONTEXT: Self::Context;

    /// Whether the processor is currently servicing an interrupt.
    fn in_interrupt(&self) -> bool;

    /// Bytes of physical stack currently in use, measured from the stack
    /// base down to the live stack pointer.
    fn stack_depth(&self) -> usize;

    /// Low-power wait until the next interrupt.
    fn wait_for_interrupt(&self);

    /// Prepare `ctx` so that the first switch into it runs
    /// `trampoline(arg)` on an empty physical stack.
    fn prime(&self, ctx: &mut Self::Context, trampoline: Trampoline, arg: *const ());

    /// Save the running fiber into `from` and resume `to`.
    ///
    /// `from` is the outgoing context and the top of its stack buffer, or
    /// `None` to discard the outgoing state. Returns when something later
    /// switches back into `from`.
    ///
    /// # Safety
    /// - The outgoing buffer must hold at least `stack_depth()` bytes as
    ///   measured in the caller, plus `config::STACK_HEADROOM`.
    /// - `to` must have been saved by this port or primed, and `to_stack`
    ///   must be the top of the buffer its image was saved into.
    /// - Must be entered with interrupts enabled; the port masks them while
    ///   the physical stack is being rewritten.
    unsafe fn swap_context(
        &self,
        from: Option<(*mut Self::Context, *mut u8)>,
        to: *const Self::Context,
        to_stack: *const u8,
    );

    /// Save registers and the stack image into `ctx` and the buffer ending
    /// at `stack_top`, without switching. Switching into `ctx` later returns
    /// from this call a second time.
    ///
    /// # Safety
    /// The buffer must hold at least `stack_depth()` plus
    /// `config::STACK_HEADROOM` bytes.
    unsafe fn save_context(&self, ctx: *mut Self::Context, stack_top: *mut u8);

    /// Save registers only.
    ///
    /// # Safety
    /// `ctx` must be valid for writes.
    unsafe fn save_register_context(&self, ctx: *mut Self::Context);

    /// Restore registers saved by [`Port::save_register_context`]. On
    /// hardware this does not return: execution continues at the return
    /// point of that save, whose frame must still be live on the stack.
    ///
    /// # Safety
    /// `ctx` must hold a register save taken on a still-live frame.
    unsafe fn restore_register_context(&self, ctx: *const Self::Context);
}
