//! # Kernel
//!
//! Target-side public API. Owns the one global scheduler and exposes it as
//! free functions, so application code and interrupt handlers never need a
//! reference to it. Errors are logged here; callers that care can use
//! [`scheduler`] directly and get the `Result`.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► heap init                 ← Stack images are heap allocated
//!         ├─► kernel::scheduler_init()  ← main() becomes the main fiber
//!         ├─► kernel::create_fiber()    ← Register fibers (×N)
//!         ├─► kernel::start()           ← SysTick starts ticking
//!         └─► kernel::release_fiber()   ← or keep working as a fiber
//! ```

use log::error;

use crate::arch::cortex_m::{configure_systick, CortexM};
use crate::error::Result;
use crate::event::Event;
use crate::fiber::FiberId;
use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// Global scheduler instance. Its address is baked into every fiber it
/// creates, which a `static` guarantees never changes.
static SCHEDULER: Scheduler<CortexM> = Scheduler::new(CortexM);

#[inline]
pub fn scheduler() -> &'static Scheduler<CortexM> {
    &SCHEDULER
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Adopt the calling context as the main fiber. Must be called once, from
/// thread mode, before anything else here.
pub fn scheduler_init() -> Result<FiberId> {
    SCHEDULER.scheduler_init()
}

/// Start the tick. Sleeping fibers only wake once this has been called.
pub fn start(syst: &mut ::cortex_m::peripheral::SYST) {
    configure_systick(syst);
}

/// Create a fiber running `entry`. It is released when `entry` returns.
pub fn create_fiber(entry: fn()) -> Result<FiberId> {
    SCHEDULER.create_fiber(entry, None)
}

/// Create a fiber running `entry`, then `completion`.
pub fn create_fiber_with_completion(entry: fn(), completion: fn()) -> Result<FiberId> {
    SCHEDULER.create_fiber(entry, Some(completion))
}

/// Create a fiber running `entry(param)`, then `completion(param)` if given.
pub fn create_fiber_with_param(
    entry: fn(*mut ()),
    param: *mut (),
    completion: Option<fn(*mut ())>,
) -> Result<FiberId> {
    SCHEDULER.create_fiber_with_param(entry, param, completion)
}

/// Terminate the calling fiber. **Does not return.**
pub fn release_fiber() -> ! {
    if let Err(e) = SCHEDULER.release_fiber() {
        error!("release_fiber: {}", e);
    }
    loop {
        ::cortex_m::asm::wfi();
    }
}

/// Yield to the next runnable fiber.
pub fn schedule() {
    if let Err(e) = SCHEDULER.schedule() {
        error!("schedule: {}", e);
    }
}

/// Block the calling fiber for at least `ms` milliseconds.
pub fn fiber_sleep(ms: u32) {
    if let Err(e) = SCHEDULER.fiber_sleep(ms) {
        error!("fiber_sleep: {}", e);
    }
}

/// Block the calling fiber until a matching event is raised.
pub fn fiber_wait_for_event(id: u16, value: u16) {
    if let Err(e) = SCHEDULER.fiber_wait_for_event(id, value) {
        error!("fiber_wait_for_event: {}", e);
    }
}

/// Run `entry` now, giving it a fiber only if it blocks.
pub fn fork_on_block(entry: fn()) {
    if let Err(e) = SCHEDULER.fork_on_block(entry) {
        error!("fork_on_block: {}", e);
    }
}

pub fn fork_on_block_with_param(entry: fn(*mut ()), param: *mut ()) {
    if let Err(e) = SCHEDULER.fork_on_block_with_param(entry, param) {
        error!("fork_on_block_with_param: {}", e);
    }
}

/// Deliver an event to waiting fibers. Safe to call from interrupt handlers.
pub fn raise_event(evt: Event) {
    SCHEDULER.scheduler_event(evt);
}

/// Ask the idle task to run housekeeping. Safe to call from interrupt
/// handlers.
pub fn request_housekeeping(flags: u8) {
    SCHEDULER.request_housekeeping(flags);
}

/// Install the routine the idle task runs while housekeeping is pending.
pub fn set_housekeeping(hook: Option<fn(u8)>) {
    SCHEDULER.set_housekeeping(hook);
}
