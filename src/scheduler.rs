//! # Scheduler
//!
//! Core scheduling logic. Implements a cooperative, non-preemptive fiber
//! scheduler for a single core, where every fiber shares the one physical
//! stack and is kept as a stack image while switched out.
//!
//! ## Scheduling Algorithm
//!
//! On every call to [`Scheduler::schedule`]:
//! 1. **Fork check**: if the current fiber is running a fork-on-block
//!    callee, that callee is moved into a child fiber instead of switching
//! 2. **Select**: the successor of the current fiber on the run queue, or the
//!    head of the run queue if the current fiber is not on it
//! 3. **Verify**: grow the outgoing fiber's stack buffer if the live stack no
//!    longer fits
//! 4. **Switch**: hand both contexts to the port
//! 5. **Idle**: with nothing runnable, run the idle task once and re-check
//!
//! The running fiber stays on the run queue while it runs. New and woken
//! fibers are inserted at the head, so the most recently readied fiber is
//! dispatched first.
//!
//! ## Interrupt Context
//!
//! [`Scheduler::scheduler_tick`], [`Scheduler::scheduler_event`] and
//! [`Scheduler::request_housekeeping`] may be called from interrupt handlers.
//! They never allocate and only relink queues. Everything else returns
//! [`FiberError::InterruptContext`] when called from a handler.
//!
//! ## Shared State
//!
//! All bookkeeping lives in one `RefCell` behind a critical-section mutex and
//! is borrowed for the duration of a single step. The borrow is never held
//! across a port primitive or across user code, since either may end up
//! back in the scheduler on another fiber.

use alloc::vec::Vec;
use core::cell::{RefCell, UnsafeCell};

use critical_section::Mutex;
use log::{debug, error, info, trace, warn};

use crate::arch::{Port, Trampoline};
use crate::config::{FIBER_TICK_PERIOD_MS, MAX_FIBERS, STACK_HEADROOM};
use crate::error::{FiberError, Result};
use crate::event::Event;
use crate::fiber::{Entry, FiberId, FiberTable, FLAG_CHILD, FLAG_FOB, FLAG_PARENT};
use crate::queue::QueueKind;
use crate::sync;

/// Housekeeping bit: buffered data is waiting to be read.
pub const FLAG_DATA_READ: u8 = 0x01;

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

struct State {
    fibers: FiberTable,

    /// The fiber that is executing. `None` until `scheduler_init`.
    current: Option<FiberId>,

    /// Child allocated by a blocking call in fork-on-block mode, waiting
    /// for `schedule` to move the callee into it.
    forked: Option<FiberId>,

    /// Tick counter. Only `scheduler_tick` advances it.
    ticks: u32,

    /// Pending housekeeping bits for the idle task.
    flags: u8,

    housekeeping: Option<fn(u8)>,
}

impl State {
    const fn new() -> Self {
        Self {
            fibers: FiberTable::new(),
            current: None,
            forked: None,
            ticks: 0,
            flags: 0,
            housekeeping: None,
        }
    }

    fn current(&self) -> Result<FiberId> {
        self.current.ok_or(FiberError::NotInitialized)
    }

    /// Round-robin successor of `old` on the run queue.
    fn next_runnable(&self, old: FiberId) -> Option<FiberId> {
        let run = self.fibers.head(QueueKind::Run);
        if self.fibers[old].queue == Some(QueueKind::Run) {
            self.fibers[old].next.or(run)
        } else {
            run
        }
    }

    /// The fiber a blocking call should park: a fresh child in fork-on-block
    /// mode, otherwise `me`.
    fn blocking_fiber(&mut self, me: FiberId) -> Result<FiberId> {
        if !self.fibers[me].has(FLAG_FOB) {
            return Ok(me);
        }
        let child = self.allocate()?;
        self.forked = Some(child);
        Ok(child)
    }

    /// A clean control block. The current fiber may already sit in the pool
    /// while it is being released, and is never handed out until it has
    /// been switched away from.
    fn allocate(&mut self) -> Result<FiberId> {
        self.fibers.get_fiber_context_except(self.current)
    }

    /// Make `f`'s buffer hold `depth` bytes measured here plus the
    /// headroom the port's routines need below this frame.
    fn verify_stack_size(&mut self, f: FiberId, depth: usize) -> Result<()> {
        match self.fibers[f].stack.ensure(depth.saturating_add(STACK_HEADROOM)) {
            Ok(true) => {
                debug!("{} stack grown to {} bytes", f, self.fibers[f].stack.size());
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("{}: {}", f, e);
                Err(e)
            }
        }
    }
}

/// What `dispatch` decided while holding the state.
enum Next<C> {
    /// The run queue is empty.
    Empty,
    /// The current fiber is the only choice.
    Same,
    Switch {
        from: Option<(*mut C, *mut u8)>,
        to: *const C,
        to_stack: *const u8,
    },
}

/// Snapshot of one control block, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberInfo {
    pub queue: Option<QueueKind>,
    pub flags: u8,
    /// Wake tick while sleeping, packed event filter while waiting.
    pub context: u32,
    pub stack_size: usize,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The fiber scheduler, generic over the execution primitive it runs on.
///
/// On the target a single instance lives in a `static` (see `kernel`). The
/// address of the scheduler is handed to newly created fibers, so it must
/// not move once a fiber has been created.
pub struct Scheduler<P: Port> {
    port: P,
    state: Mutex<RefCell<State>>,
    /// Saved register contexts, one per table slot. Only the port touches
    /// these, and only for fibers that are not running.
    contexts: [UnsafeCell<P::Context>; MAX_FIBERS],
}

// Safety: `state` is only reached through critical sections. A context
// cell is written by the port either for the fiber being switched out or
// for one that is not running, never concurrently with an ISR.
unsafe impl<P: Port + Sync> Sync for Scheduler<P> {}

impl<P: Port> Scheduler<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            state: Mutex::new(RefCell::new(State::new())),
            contexts: [const { UnsafeCell::new(P::EMPTY_CONTEXT) }; MAX_FIBERS],
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        sync::critical_section(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    #[inline]
    fn context_of(&self, f: FiberId) -> *mut P::Context {
        self.contexts[f.index()].get()
    }

    fn check_thread_mode(&self) -> Result<()> {
        if self.port.in_interrupt() {
            return Err(FiberError::InterruptContext);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Adopt the calling context as the main fiber.
    ///
    /// # Returns
    /// - `Ok(id)`: the main fiber's handle
    /// - `Err(AlreadyInitialized)`: called a second time
    pub fn scheduler_init(&self) -> Result<FiberId> {
        self.with_state(|st| -> Result<FiberId> {
            if st.current.is_some() {
                return Err(FiberError::AlreadyInitialized);
            }
            let main = st.allocate()?;
            st.fibers.queue_fiber(main, QueueKind::Run);
            st.current = Some(main);
            info!("fiber scheduler started, main is {}", main);
            Ok(main)
        })
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|st| st.current.is_some())
    }

    /// Create a fiber that runs `entry`, then `completion`.
    ///
    /// With no completion the fiber is released when `entry` returns. A
    /// completion that returns is followed by the release as well.
    pub fn create_fiber(&self, entry: fn(), completion: Option<fn()>) -> Result<FiberId> {
        self.spawn(Entry::Plain { entry, completion })
    }

    /// Create a fiber that runs `entry(param)`, then `completion(param)`.
    pub fn create_fiber_with_param(
        &self,
        entry: fn(*mut ()),
        param: *mut (),
        completion: Option<fn(*mut ())>,
    ) -> Result<FiberId> {
        self.spawn(Entry::Param {
            entry,
            param,
            completion,
        })
    }

    fn spawn(&self, entry: Entry) -> Result<FiberId> {
        self.check_thread_mode()?;

        let f = self.with_state(|st| -> Result<FiberId> {
            st.current()?;
            let f = st.allocate()?;
            st.fibers[f].entry = Some(entry);
            Ok(f)
        })?;

        // Safety: `f` is neither running nor queued yet.
        let ctx = unsafe { &mut *self.context_of(f) };
        self.port.prime(ctx, Self::trampoline as Trampoline, self as *const Self as *const ());

        self.with_state(|st| st.fibers.queue_fiber(f, QueueKind::Run));
        debug!("created {}", f);
        Ok(f)
    }

    /// First code every new fiber runs. `arg` is the scheduler.
    unsafe extern "C" fn trampoline(arg: *const ()) -> ! {
        let sched = &*(arg as *const Self);
        if let Err(e) = sched.launch_or_release() {
            error!("fiber not released: {}", e);
        }
        // Only reached if the release failed. Keep the others running.
        loop {
            if sched.schedule().is_err() {
                sched.port.wait_for_interrupt();
            }
        }
    }

    /// Launch the current fiber. If it cannot be launched, release it so
    /// that its slot and the CPU go to the other fibers.
    fn launch_or_release(&self) -> Result<()> {
        match self.launch_current() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("fiber launch failed: {}", e);
                if self.current_fiber().is_some_and(|me| !self.in_pool(me)) {
                    self.release_fiber()
                } else {
                    Err(e)
                }
            }
        }
    }

    fn in_pool(&self, f: FiberId) -> bool {
        self.with_state(|st| st.fibers[f].queue == Some(QueueKind::Pool))
    }

    /// Run the current fiber's pending entry and completion, then release
    /// it unless the completion already has.
    fn launch_current(&self) -> Result<()> {
        let (me, entry) = self.with_state(|st| -> Result<(FiberId, Entry)> {
            let me = st.current()?;
            let entry = st.fibers[me].entry.take().ok_or(FiberError::NoEntry)?;
            Ok((me, entry))
        })?;

        entry.call();
        entry.complete();

        if self.current_fiber() == Some(me) {
            self.release_fiber()
        } else {
            Ok(())
        }
    }

    /// Terminate the current fiber and switch to the next runnable one.
    ///
    /// The control block goes back to the pool with its stack buffer kept.
    /// On hardware this only returns on error.
    pub fn release_fiber(&self) -> Result<()> {
        self.check_thread_mode()?;

        let me = self.with_state(|st| -> Result<FiberId> {
            let me = st.current()?;
            st.fibers.recycle(me)?;
            Ok(me)
        })?;
        debug!("released {}", me);

        loop {
            self.schedule()?;
            if self.current_fiber() != Some(me) {
                return Ok(());
            }
        }
    }

    /// Grow the current fiber's stack buffer if it cannot hold the live
    /// stack. Switched-out fibers are never resized here, since their
    /// buffers hold the only copy of their stacks.
    pub fn verify_stack_size(&self) -> Result<()> {
        self.check_thread_mode()?;
        let depth = self.port.stack_depth();
        self.with_state(|st| -> Result<()> {
            let me = st.current()?;
            st.verify_stack_size(me, depth)
        })
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Yield to the next runnable fiber.
    ///
    /// Returns once this fiber is switched back in, or straight away if no
    /// other fiber is runnable.
    pub fn schedule(&self) -> Result<()> {
        self.check_thread_mode()?;

        let forking = self.with_state(|st| -> Result<bool> {
            let me = st.current()?;
            Ok(st.fibers[me].has(FLAG_FOB))
        })?;
        if forking {
            return self.fork_current();
        }

        if !self.dispatch()? {
            self.idle_task();
            self.dispatch()?;
        }
        Ok(())
    }

    /// Switch to the next runnable fiber, if any.
    ///
    /// # Returns
    /// `false` if the run queue is empty.
    fn dispatch(&self) -> Result<bool> {
        let depth = self.port.stack_depth();

        let next = self.with_state(|st| -> Result<Next<P::Context>> {
            let old = st.current()?;
            let Some(next) = st.next_runnable(old) else {
                return Ok(Next::Empty);
            };
            if next == old {
                return Ok(Next::Same);
            }

            let from = if st.fibers[old].queue == Some(QueueKind::Pool) {
                None
            } else {
                st.verify_stack_size(old, depth)?;
                Some((self.context_of(old), st.fibers[old].stack.top()))
            };

            st.current = Some(next);
            trace!("switch {} -> {}", old, next);
            Ok(Next::Switch {
                from,
                to: self.context_of(next),
                to_stack: st.fibers[next].stack.top(),
            })
        })?;

        match next {
            Next::Empty => Ok(false),
            Next::Same => Ok(true),
            Next::Switch { from, to, to_stack } => {
                // Safety: `from` was sized for `depth` plus headroom, and
                // `to` was either saved by the port or primed by `spawn`.
                unsafe { self.port.swap_context(from, to, to_stack) };
                Ok(true)
            }
        }
    }

    /// Move the fork-on-block callee running on the current fiber into a
    /// child, then resume the parent where it entered `fork_on_block`.
    fn fork_current(&self) -> Result<()> {
        let depth = self.port.stack_depth();

        let (parent, child, top) = self.with_state(|st| -> Result<(FiberId, FiberId, *mut u8)> {
            let parent = st.current()?;
            let child = match st.forked.take() {
                Some(c) => c,
                None => {
                    // A plain yield: the child is immediately runnable.
                    let c = st.allocate()?;
                    st.fibers.queue_fiber(c, QueueKind::Run);
                    c
                }
            };
            if let Err(e) = st.verify_stack_size(child, depth) {
                st.fibers.recycle(child)?;
                return Err(e);
            }
            st.fibers[parent].flags |= FLAG_PARENT;
            st.fibers[child].flags |= FLAG_CHILD;
            debug!("{} forked into {}", parent, child);
            Ok((parent, child, st.fibers[child].stack.top()))
        })?;

        // Safety: the child's buffer holds `depth` plus headroom. When the
        // child is first switched in, this call returns a second time on its
        // behalf.
        unsafe { self.port.save_context(self.context_of(child), top) };

        let unwind = self.with_state(|st| {
            st.current == Some(parent) && st.fibers[parent].has(FLAG_PARENT)
        });
        if unwind {
            // Safety: the parent's register save was taken in `invoke`,
            // whose frame is still below us on the stack.
            unsafe { self.port.restore_register_context(self.context_of(parent)) };
        }
        Ok(())
    }

    /// Schedule until `me` is switched out or runnable again.
    fn block(&self, me: FiberId) -> Result<()> {
        loop {
            if let Err(e) = self.schedule() {
                self.with_state(|st| {
                    if !st.fibers[me].has(FLAG_FOB) {
                        st.fibers.queue_fiber(me, QueueKind::Run);
                    }
                });
                return Err(e);
            }

            let done = self.with_state(|st| {
                st.current != Some(me) || st.fibers[me].queue == Some(QueueKind::Run)
            });
            if done {
                return Ok(());
            }
        }
    }

    /// Block the current fiber for at least `ms` milliseconds.
    ///
    /// The wake-up tick is `ticks + ceil(ms / FIBER_TICK_PERIOD_MS)`, so a
    /// sleep of zero lasts until the next tick.
    pub fn fiber_sleep(&self, ms: u32) -> Result<()> {
        self.check_thread_mode()?;

        let me = self.with_state(|st| -> Result<FiberId> {
            let me = st.current()?;
            let wake = st.ticks.wrapping_add(ms.div_ceil(FIBER_TICK_PERIOD_MS));
            let f = st.blocking_fiber(me)?;
            st.fibers[f].context = wake;
            st.fibers.queue_fiber(f, QueueKind::Sleep);
            trace!("{} sleeps until tick {}", f, wake);
            Ok(me)
        })?;

        self.block(me)
    }

    /// Block the current fiber until an event from `id` with `value` is
    /// raised. Zero in either field matches anything.
    ///
    /// Events raised before this call are not remembered.
    pub fn fiber_wait_for_event(&self, id: u16, value: u16) -> Result<()> {
        self.check_thread_mode()?;

        let me = self.with_state(|st| -> Result<FiberId> {
            let me = st.current()?;
            let f = st.blocking_fiber(me)?;
            st.fibers[f].context = Event::new(id, value).pack();
            st.fibers.queue_fiber(f, QueueKind::Wait);
            trace!("{} waits for {}:{}", f, id, value);
            Ok(me)
        })?;

        self.block(me)
    }

    // -----------------------------------------------------------------------
    // Fork-on-block
    // -----------------------------------------------------------------------

    /// Call `entry` on the current fiber's stack, materialising a fiber for
    /// it only if it blocks.
    ///
    /// Returns when `entry` returns, or as soon as it blocks. If the current
    /// fiber is already inside a fork-on-block call, `entry` is given a
    /// fiber of its own straight away.
    pub fn fork_on_block(&self, entry: fn()) -> Result<()> {
        self.invoke(Entry::Plain {
            entry,
            completion: None,
        })
    }

    pub fn fork_on_block_with_param(&self, entry: fn(*mut ()), param: *mut ()) -> Result<()> {
        self.invoke(Entry::Param {
            entry,
            param,
            completion: None,
        })
    }

    #[inline(never)]
    fn invoke(&self, entry: Entry) -> Result<()> {
        self.check_thread_mode()?;

        let (me, nested) = self.with_state(|st| -> Result<(FiberId, bool)> {
            let me = st.current()?;
            let fiber = &mut st.fibers[me];
            let nested = fiber.has(FLAG_FOB);
            fiber.flags |= FLAG_FOB;
            Ok((me, nested))
        })?;

        if nested {
            self.spawn(entry)?;
            return Ok(());
        }

        // Safety: this frame stays live until `invoke` returns, and the
        // parent is only resumed into it from `fork_current`.
        unsafe { self.port.save_register_context(self.context_of(me)) };
        if self.take_parent_unwind(me) {
            trace!("{} resumed after fork", me);
            return Ok(());
        }

        entry.call();
        self.finish_fork(me)
    }

    /// Clear the parent marks if `me` has been resumed by `fork_current`.
    fn take_parent_unwind(&self, me: FiberId) -> bool {
        self.with_state(|st| {
            let fiber = &mut st.fibers[me];
            if !fiber.has(FLAG_PARENT) {
                return false;
            }
            fiber.flags &= !(FLAG_FOB | FLAG_PARENT);
            true
        })
    }

    /// Epilogue of a fork-on-block callee. On `me` it leaves fork-on-block
    /// mode; on a materialised child it releases the child.
    fn finish_fork(&self, me: FiberId) -> Result<()> {
        let in_child = self.with_state(|st| match st.current {
            Some(f) if f == me => {
                st.fibers[f].flags &= !(FLAG_FOB | FLAG_PARENT);
                false
            }
            _ => true,
        });
        if in_child {
            self.release_fiber()
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Collaborators (interrupt safe)
    // -----------------------------------------------------------------------

    /// Timer callback. Advances the tick counter and readies every sleeper
    /// whose wake tick has passed.
    pub fn scheduler_tick(&self) {
        self.with_state(|st| {
            st.ticks = st.ticks.wrapping_add(1);
            let now = st.ticks;

            let mut cursor = st.fibers.head(QueueKind::Sleep);
            while let Some(f) = cursor {
                cursor = st.fibers[f].next;
                if (now.wrapping_sub(st.fibers[f].context) as i32) >= 0 {
                    st.fibers.queue_fiber(f, QueueKind::Run);
                    trace!("{} woken at tick {}", f, now);
                }
            }
        });
    }

    /// Event callback. Readies every waiter whose registration accepts `evt`.
    pub fn scheduler_event(&self, evt: Event) {
        self.with_state(|st| {
            let mut cursor = st.fibers.head(QueueKind::Wait);
            while let Some(f) = cursor {
                cursor = st.fibers[f].next;
                if Event::unpack(st.fibers[f].context).accepts(&evt) {
                    st.fibers.queue_fiber(f, QueueKind::Run);
                    trace!("{} woken by {}:{}", f, evt.source, evt.value);
                }
            }
        });
    }

    /// Ask the idle task to run housekeeping for `flags`.
    pub fn request_housekeeping(&self, flags: u8) {
        self.with_state(|st| st.flags |= flags);
    }

    /// Install the routine the idle task runs, in place of sleeping, while
    /// housekeeping bits are pending.
    pub fn set_housekeeping(&self, hook: Option<fn(u8)>) {
        self.with_state(|st| st.housekeeping = hook);
    }

    /// Idle fallback for an empty run queue. Runs pending housekeeping if a
    /// routine is installed, otherwise waits for the next interrupt.
    pub fn idle_task(&self) {
        let pending = self.with_state(|st| match (st.housekeeping, st.flags) {
            (Some(hook), flags) if flags != 0 => {
                st.flags = 0;
                Some((hook, flags))
            }
            _ => None,
        });

        match pending {
            Some((hook, flags)) => hook(flags),
            None => self.port.wait_for_interrupt(),
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn current_fiber(&self) -> Option<FiberId> {
        self.with_state(|st| st.current)
    }

    pub fn ticks(&self) -> u32 {
        self.with_state(|st| st.ticks)
    }

    /// Milliseconds since start, at tick resolution.
    pub fn system_time_ms(&self) -> u64 {
        self.ticks() as u64 * FIBER_TICK_PERIOD_MS as u64
    }

    /// `None` for a slot that has never been handed out.
    pub fn fiber_info(&self, f: FiberId) -> Option<FiberInfo> {
        self.with_state(|st| {
            if f.index() >= st.fibers.allocated() {
                return None;
            }
            let fiber = &st.fibers[f];
            Some(FiberInfo {
                queue: fiber.queue,
                flags: fiber.flags,
                context: fiber.context,
                stack_size: fiber.stack.size(),
            })
        })
    }

    /// Members of `queue`, head first.
    pub fn queued(&self, queue: QueueKind) -> Vec<FiberId> {
        self.with_state(|st| st.fibers.iter(queue).collect())
    }

    /// Control blocks handed out so far, pooled ones included.
    pub fn fiber_count(&self) -> usize {
        self.with_state(|st| st.fibers.allocated())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
