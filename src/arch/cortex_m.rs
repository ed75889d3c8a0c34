//! # Cortex-M Port Layer
//!
//! Hardware-specific code for ARM Cortex-M processors. The context routines
//! are restricted to the Thumb-1 subset, so the same port runs on ARMv6-M
//! (Cortex-M0) and ARMv7-M parts.
//!
//! ## Execution Model
//!
//! Unlike a preemptive kernel there is no PendSV and no process stack:
//! every fiber runs in Thread mode on the main stack, and switches are
//! ordinary function calls. A switch stores the callee-saved registers,
//! the stack pointer and the return address, copies `[sp, STACK_BASE)` into
//! the outgoing fiber's buffer, copies the incoming image back, then loads
//! the incoming registers and returns into the incoming fiber.
//!
//! ## Context Layout
//!
//! ```text
//! offset  0..32   R4-R11
//! offset 32       R0   (trampoline argument on first launch)
//! offset 36       SP
//! offset 40       LR   (resume address)
//! ```

use core::arch::naked_asm;

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;

use super::{Port, Trampoline};
use crate::config::{FIBER_TICK_PERIOD_MS, STACK_BASE, SYSTEM_CLOCK_HZ};

/// Saved register state of a switched-out fiber.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    regs: [u32; 8],
    r0: u32,
    sp: u32,
    lr: u32,
}

/// The Cortex-M execution primitive.
#[derive(Debug, Clone, Copy)]
pub struct CortexM;

impl Port for CortexM {
    type Context = Context;

    const EMPTY_CONTEXT: Context = Context {
        regs: [0; 8],
        r0: 0,
        sp: 0,
        lr: 0,
    };

    #[inline]
    fn in_interrupt(&self) -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }

    #[inline(always)]
    fn stack_depth(&self) -> usize {
        STACK_BASE - cortex_m::register::msp::read() as usize
    }

    #[inline]
    fn wait_for_interrupt(&self) {
        cortex_m::asm::wfi();
    }

    fn prime(&self, ctx: &mut Context, trampoline: Trampoline, arg: *const ()) {
        *ctx = Context {
            regs: [0; 8],
            r0: arg as u32,
            sp: STACK_BASE as u32,
            lr: trampoline as usize as u32,
        };
    }

    #[inline(always)]
    unsafe fn swap_context(
        &self,
        from: Option<(*mut Context, *mut u8)>,
        to: *const Context,
        to_stack: *const u8,
    ) {
        let (from_ctx, from_stack) = match from {
            Some(out) => out,
            None => (core::ptr::null_mut(), core::ptr::null_mut()),
        };
        swap_context(from_ctx, from_stack, to, to_stack);
    }

    #[inline(always)]
    unsafe fn save_context(&self, ctx: *mut Context, stack_top: *mut u8) {
        save_context(ctx, stack_top);
    }

    #[inline(always)]
    unsafe fn save_register_context(&self, ctx: *mut Context) {
        save_register_context(ctx);
    }

    #[inline(always)]
    unsafe fn restore_register_context(&self, ctx: *const Context) {
        restore_register_context(ctx);
    }
}

// ---------------------------------------------------------------------------
// Context routines
// ---------------------------------------------------------------------------

/// Switch from `from` (null to discard) to `to`.
///
/// r0 = from, r1 = from stack top, r2 = to, r3 = to stack top.
#[unsafe(naked)]
unsafe extern "C" fn swap_context(
    _from: *mut Context,
    _from_stack: *mut u8,
    _to: *const Context,
    _to_stack: *const u8,
) {
    naked_asm!(
        "cpsid i",
        "cmp r0, #0",
        "beq 3f",

        // --- Save outgoing registers ---
        "str r4, [r0, #0]",
        "str r5, [r0, #4]",
        "str r6, [r0, #8]",
        "str r7, [r0, #12]",
        "mov r4, r8",
        "str r4, [r0, #16]",
        "mov r4, r9",
        "str r4, [r0, #20]",
        "mov r4, r10",
        "str r4, [r0, #24]",
        "mov r4, r11",
        "str r4, [r0, #28]",
        "mov r4, sp",
        "str r4, [r0, #36]",
        "mov r5, lr",
        "str r5, [r0, #40]",

        // --- Copy [sp, base) down into the outgoing buffer ---
        "ldr r5, ={base}",
        "2:",
        "cmp r5, r4",
        "beq 3f",
        "subs r5, r5, #4",
        "subs r1, r1, #4",
        "ldr r6, [r5]",
        "str r6, [r1]",
        "b 2b",

        // --- Copy the incoming image back to [to.sp, base) ---
        "3:",
        "ldr r4, [r2, #36]",
        "ldr r5, ={base}",
        "4:",
        "cmp r5, r4",
        "beq 5f",
        "subs r5, r5, #4",
        "subs r3, r3, #4",
        "ldr r6, [r3]",
        "str r6, [r5]",
        "b 4b",

        // --- Restore incoming registers ---
        "5:",
        "mov sp, r4",
        "ldr r4, [r2, #40]",
        "mov lr, r4",
        "ldr r4, [r2, #16]",
        "mov r8, r4",
        "ldr r4, [r2, #20]",
        "mov r9, r4",
        "ldr r4, [r2, #24]",
        "mov r10, r4",
        "ldr r4, [r2, #28]",
        "mov r11, r4",
        "ldr r4, [r2, #0]",
        "ldr r5, [r2, #4]",
        "ldr r6, [r2, #8]",
        "ldr r7, [r2, #12]",
        "ldr r0, [r2, #32]",
        "cpsie i",
        "bx lr",
        ".ltorg",
        base = const STACK_BASE,
    );
}

/// Save registers and the stack image without switching.
///
/// r0 = ctx, r1 = stack top. Only caller-saved registers are clobbered.
#[unsafe(naked)]
unsafe extern "C" fn save_context(_ctx: *mut Context, _stack_top: *mut u8) {
    naked_asm!(
        "str r4, [r0, #0]",
        "str r5, [r0, #4]",
        "str r6, [r0, #8]",
        "str r7, [r0, #12]",
        "mov r2, r8",
        "str r2, [r0, #16]",
        "mov r2, r9",
        "str r2, [r0, #20]",
        "mov r2, r10",
        "str r2, [r0, #24]",
        "mov r2, r11",
        "str r2, [r0, #28]",
        "mov r2, sp",
        "str r2, [r0, #36]",
        "mov r3, lr",
        "str r3, [r0, #40]",

        "ldr r3, ={base}",
        "2:",
        "cmp r3, r2",
        "beq 3f",
        "subs r3, r3, #4",
        "subs r1, r1, #4",
        "ldr r0, [r3]",
        "str r0, [r1]",
        "b 2b",
        "3:",
        "bx lr",
        ".ltorg",
        base = const STACK_BASE,
    );
}

/// r0 = ctx.
#[unsafe(naked)]
unsafe extern "C" fn save_register_context(_ctx: *mut Context) {
    naked_asm!(
        "str r4, [r0, #0]",
        "str r5, [r0, #4]",
        "str r6, [r0, #8]",
        "str r7, [r0, #12]",
        "mov r1, r8",
        "str r1, [r0, #16]",
        "mov r1, r9",
        "str r1, [r0, #20]",
        "mov r1, r10",
        "str r1, [r0, #24]",
        "mov r1, r11",
        "str r1, [r0, #28]",
        "mov r1, sp",
        "str r1, [r0, #36]",
        "mov r1, lr",
        "str r1, [r0, #40]",
        "bx lr",
    );
}

/// r0 = ctx. Resumes at the return point of the matching register save.
#[unsafe(naked)]
unsafe extern "C" fn restore_register_context(_ctx: *const Context) {
    naked_asm!(
        "ldr r1, [r0, #16]",
        "mov r8, r1",
        "ldr r1, [r0, #20]",
        "mov r9, r1",
        "ldr r1, [r0, #24]",
        "mov r10, r1",
        "ldr r1, [r0, #28]",
        "mov r11, r1",
        "ldr r1, [r0, #36]",
        "mov sp, r1",
        "ldr r1, [r0, #40]",
        "mov lr, r1",
        "ldr r4, [r0, #0]",
        "ldr r5, [r0, #4]",
        "ldr r6, [r0, #8]",
        "ldr r7, [r0, #12]",
        "bx lr",
    );
}

// ---------------------------------------------------------------------------
// SysTick
// ---------------------------------------------------------------------------

/// Configure SysTick to fire once every `FIBER_TICK_PERIOD_MS`.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / 1000 * FIBER_TICK_PERIOD_MS - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// SysTick exception handler: the timer collaborator.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::kernel::scheduler().scheduler_tick();
}
