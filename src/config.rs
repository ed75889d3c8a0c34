//! # Fiber Scheduler Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! Control blocks live in a fixed table; only stack images are heap allocated.

/// Maximum number of fiber control blocks, including the main fiber.
/// This bounds the static fiber table. Completed fibers are recycled
/// through the free pool, so this is a limit on *concurrent* fibers.
pub const MAX_FIBERS: usize = 16;

/// Period of the scheduler tick in milliseconds. The timer collaborator
/// must call `scheduler_tick()` once per period.
pub const FIBER_TICK_PERIOD_MS: u32 = 6;

/// Initial size of a fiber's stack buffer in bytes.
///
/// Fibers only hold a copy of the physical stack taken at the moment they
/// are switched out, which for a cooperative scheduler is normally tiny.
/// The buffer grows on demand when a deeper stack is observed.
pub const FIBER_STACK_SIZE: usize = 64;

/// Stack buffers grow in multiples of this many bytes, to ease heap churn.
/// Must be a power of two.
pub const STACK_GRANULE: usize = 32;

/// Bytes a stack buffer must hold beyond the depth measured by the
/// scheduler. The port's context routines are entered one call below the
/// point of measurement, and their caller's frame is copied too.
pub const STACK_HEADROOM: usize = STACK_GRANULE;

/// Address of the top of the physical (full descending) stack shared by
/// every fiber. Must equal `_stack_start` in `memory.x`.
pub const STACK_BASE: usize = 0x2000_4000;

/// System clock frequency in Hz (nRF51 16 MHz HFCLK).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;
