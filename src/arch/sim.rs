//! # Host Simulation Port
//!
//! A [`Port`] that performs no real switching. Every primitive returns
//! immediately and is counted, so host code can drive the scheduler's state
//! machine step by step: after a switch, the caller simply carries on as
//! the fiber that is now current.
//!
//! The interrupt flag and stack depth are plain settings, and an optional
//! idle hook runs in place of the low-power wait, which is how a test
//! injects the tick or event that would have woken the processor.

use core::cell::Cell;

use super::{Port, Trampoline};

/// Upper bound on idle waits between hook-less wakeups before the sim
/// declares the system deadlocked.
const IDLE_LIMIT: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimContext {
    /// Set by `prime`, cleared by any save.
    pub primed: bool,
    /// Number of saves (full or register-only) into this context.
    pub saves: u32,
}

/// Idle hook: called with its argument instead of sleeping.
pub type IdleHook = (fn(*const ()), *const ());

#[derive(Debug)]
pub struct SimPort {
    interrupt: Cell<bool>,
    depth: Cell<usize>,
    swaps: Cell<u32>,
    discarding_swaps: Cell<u32>,
    saves: Cell<u32>,
    register_saves: Cell<u32>,
    restores: Cell<u32>,
    idles: Cell<u32>,
    idle_hook: Cell<Option<IdleHook>>,
}

impl SimPort {
    pub const fn new() -> Self {
        Self {
            interrupt: Cell::new(false),
            depth: Cell::new(24),
            swaps: Cell::new(0),
            discarding_swaps: Cell::new(0),
            saves: Cell::new(0),
            register_saves: Cell::new(0),
            restores: Cell::new(0),
            idles: Cell::new(0),
            idle_hook: Cell::new(None),
        }
    }

    /// Pretend to be inside (or outside) an interrupt handler.
    pub fn set_in_interrupt(&self, inside: bool) {
        self.interrupt.set(inside);
    }

    /// Stack depth reported to the scheduler.
    pub fn set_stack_depth(&self, depth: usize) {
        self.depth.set(depth);
    }

    pub fn set_idle_hook(&self, hook: Option<IdleHook>) {
        self.idle_hook.set(hook);
    }

    /// Context switches performed, including discarding ones.
    pub fn swaps(&self) -> u32 {
        self.swaps.get()
    }

    /// Switches away from a released fiber, whose state was discarded.
    pub fn discarding_swaps(&self) -> u32 {
        self.discarding_swaps.get()
    }

    /// Full (register and stack) saves outside a switch.
    pub fn saves(&self) -> u32 {
        self.saves.get()
    }

    pub fn register_saves(&self) -> u32 {
        self.register_saves.get()
    }

    pub fn restores(&self) -> u32 {
        self.restores.get()
    }

    pub fn idles(&self) -> u32 {
        self.idles.get()
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &Cell<u32>) {
    counter.set(counter.get() + 1);
}

impl Port for SimPort {
    type Context = SimContext;

    const EMPTY_CONTEXT: SimContext = SimContext {
        primed: false,
        saves: 0,
    };

    fn in_interrupt(&self) -> bool {
        self.interrupt.get()
    }

    fn stack_depth(&self) -> usize {
        self.depth.get()
    }

    fn wait_for_interrupt(&self) {
        bump(&self.idles);
        match self.idle_hook.get() {
            Some((hook, arg)) => hook(arg),
            None => assert!(
                self.idles.get() < IDLE_LIMIT,
                "sim idled {} times with nothing to wake it",
                IDLE_LIMIT
            ),
        }
    }

    fn prime(&self, ctx: &mut SimContext, _trampoline: Trampoline, _arg: *const ()) {
        *ctx = SimContext {
            primed: true,
            saves: 0,
        };
    }

    unsafe fn swap_context(
        &self,
        from: Option<(*mut SimContext, *mut u8)>,
        _to: *const SimContext,
        _to_stack: *const u8,
    ) {
        bump(&self.swaps);
        match from {
            Some((ctx, _)) => {
                let ctx = &mut *ctx;
                ctx.primed = false;
                ctx.saves += 1;
            }
            None => bump(&self.discarding_swaps),
        }
    }

    unsafe fn save_context(&self, ctx: *mut SimContext, _stack_top: *mut u8) {
        bump(&self.saves);
        let ctx = &mut *ctx;
        ctx.primed = false;
        ctx.saves += 1;
    }

    unsafe fn save_register_context(&self, ctx: *mut SimContext) {
        bump(&self.register_saves);
        (*ctx).saves += 1;
    }

    unsafe fn restore_register_context(&self, _ctx: *const SimContext) {
        bump(&self.restores);
    }
}
