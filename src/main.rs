//! # Fibers Demo Firmware
//!
//! Runs a handful of fibers on an nRF51822:
//!
//! | Fiber | Behavior |
//! |-------|----------|
//! | `heartbeat` | Sleeps 500 ms in a loop, raising a heartbeat event each time |
//! | `listener` | Waits for heartbeat events, counts them and asks the idle task to log the count |
//! | `on_heartbeat` | Handler run through fork-on-block; sleeps every 4th beat |
//! | `main` | Sets everything up, then releases itself |
//!
//! Most heartbeats are handled inline by `on_heartbeat` without any fiber
//! being created. Only the beats on which it sleeps get a child fiber.

#![no_std]
#![no_main]

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc_cortex_m::CortexMHeap;
use cortex_m_rt::entry;
use panic_halt as _;

use fibers::kernel;
use fibers::{Event, FLAG_DATA_READ};

#[global_allocator]
static ALLOCATOR: CortexMHeap = CortexMHeap::empty();

/// Heap for stack images. The physical stack and statics take the rest.
const HEAP_SIZE: usize = 4 * 1024;

const ID_HEARTBEAT: u16 = 1;
const EVT_BEAT: u16 = 1;

static BEATS: AtomicU32 = AtomicU32::new(0);
static HEARD: AtomicU32 = AtomicU32::new(0);
static LOGGED: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// Fiber entry points
// ---------------------------------------------------------------------------

fn heartbeat() {
    loop {
        kernel::fiber_sleep(500);
        BEATS.fetch_add(1, Ordering::Relaxed);
        kernel::raise_event(Event::new(ID_HEARTBEAT, EVT_BEAT));
        kernel::fork_on_block(on_heartbeat);
    }
}

fn listener() {
    loop {
        kernel::fiber_wait_for_event(ID_HEARTBEAT, EVT_BEAT);
        HEARD.fetch_add(1, Ordering::Relaxed);
        kernel::request_housekeeping(FLAG_DATA_READ);
    }
}

/// Runs from the idle task, never on a fiber of its own.
fn housekeeping(flags: u8) {
    if flags & FLAG_DATA_READ != 0 {
        LOGGED.store(HEARD.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

fn on_heartbeat() {
    if BEATS.load(Ordering::Relaxed) % 4 == 0 {
        // Blocks, so this call gets a fiber of its own.
        kernel::fiber_sleep(100);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    {
        static mut HEAP: [MaybeUninit<u8>; HEAP_SIZE] = [MaybeUninit::uninit(); HEAP_SIZE];
        unsafe { ALLOCATOR.init(core::ptr::addr_of_mut!(HEAP) as usize, HEAP_SIZE) }
    }

    let mut cp = cortex_m::Peripherals::take().unwrap();

    kernel::scheduler_init().expect("Failed to initialise the scheduler");
    kernel::create_fiber(heartbeat).expect("Failed to create heartbeat");
    kernel::create_fiber(listener).expect("Failed to create listener");
    kernel::set_housekeeping(Some(housekeeping));

    kernel::start(&mut cp.SYST);

    // Nothing left for main to do; the idle task takes over whenever the
    // other fibers are all blocked.
    kernel::release_fiber()
}
