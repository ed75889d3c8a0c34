//! # fibers: Cooperative Fibers with Stack Duplication
//!
//! A non-preemptive fiber scheduler for single-core microcontrollers with a
//! few kilobytes of RAM, such as the nRF51822 (Cortex-M0, 16 KiB).
//!
//! ## Overview
//!
//! Every fiber runs on the one physical stack. While a fiber is switched
//! out, the part of the stack it was using is copied into a small heap
//! buffer, typically a few tens of bytes, and copied back when it resumes.
//! Fibers give up the CPU only by yielding, sleeping, waiting for an event
//! or returning, so no fiber is ever interrupted by another.
//!
//! - **Run queue**: fibers ready to execute, most recently readied first
//! - **Sleep queue**: fibers woken by the periodic tick
//! - **Wait queue**: fibers woken by a matching `(source, value)` event
//! - **Fork-on-block**: event handlers run inline on the caller's stack and
//!   only get a fiber of their own if they block
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Fibers                    │
//! ├────────────────────────────────────────────────────────┤
//! │            Kernel API (kernel.rs, target only)         │
//! │  scheduler_init · create_fiber · schedule · sleep ...  │
//! ├──────────────────────────────┬─────────────────────────┤
//! │  Scheduler (scheduler.rs)    │  Sync Primitives        │
//! │  ─ schedule() · idle_task()  │  sync.rs                │
//! │  ─ tick() · event()          │  ─ critical_section     │
//! │  ─ fork_on_block()           │                         │
//! ├──────────────────────────────┴─────────────────────────┤
//! │   Fibers & Queues (fiber.rs, queue.rs, event.rs)       │
//! │   FiberTable · Stack · QueueKind · Event               │
//! ├────────────────────────────────────────────────────────┤
//! │   Port (arch/): Cortex-M naked asm │ host simulation   │
//! │   swap · save · restore · wfi · in_interrupt           │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **Fixed control blocks**: `[Fiber; MAX_FIBERS]`, recycled through a pool
//! - **Heap stack images**: grown on demand in 32-byte steps, never shrunk
//! - **Critical sections**: `critical_section::with()` for shared state
//!
//! ## Host Builds
//!
//! Off-target the crate builds against [`arch::sim::SimPort`], which counts
//! port primitives instead of executing them. The scheduler logic is the
//! same code either way, and is unit tested on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod event;
pub mod fiber;
pub mod queue;
pub mod scheduler;
pub mod sync;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod kernel;

pub use error::{FiberError, Result};
pub use event::{Event, EVT_ANY, ID_ANY};
pub use fiber::FiberId;
pub use queue::QueueKind;
pub use scheduler::{FiberInfo, Scheduler, FLAG_DATA_READ};
