//! # Fiber Control Block
//!
//! Defines the fiber model. A fiber is a logical thread of execution that
//! shares the one physical stack with every other fiber: while it is switched
//! out, the part of the physical stack it was using is kept in a small heap
//! buffer owned by the fiber, and copied back when it is switched in again.
//!
//! Control blocks live in a fixed [`FiberTable`] and are addressed by
//! [`FiberId`]. Completed fibers are parked on the pool queue and handed out
//! again by [`FiberTable::get_fiber_context`] before any fresh slot is used.

use alloc::vec::Vec;
use core::fmt;
use core::ops::{Index, IndexMut};

use crate::config::{FIBER_STACK_SIZE, MAX_FIBERS, STACK_GRANULE};
use crate::error::{FiberError, Result};
use crate::queue::QueueKind;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// The fiber is running a fork-on-block callee directly on its own stack.
pub const FLAG_FOB: u8 = 0x01;
/// A fork-on-block callee blocked and was moved into a child fiber.
pub const FLAG_PARENT: u8 = 0x02;
/// The fiber was materialised to hold a blocked fork-on-block callee.
pub const FLAG_CHILD: u8 = 0x04;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Stable handle to a slot of the fiber table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u8);

impl FiberId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u8)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stack image buffer
// ---------------------------------------------------------------------------

/// Size of the buffer needed to hold a stack image of `depth` bytes.
///
/// Rounded up to the next multiple of `STACK_GRANULE`, always leaving at
/// least one byte of headroom.
pub const fn allocation_for(depth: usize) -> usize {
    depth.saturating_add(STACK_GRANULE) & !(STACK_GRANULE - 1)
}

/// Heap buffer holding a fiber's stack image while it is switched out.
///
/// The image is full descending: it is written downwards from [`Stack::top`].
#[derive(Debug)]
pub struct Stack {
    buf: Vec<u8>,
}

impl Stack {
    pub const fn empty() -> Self {
        Self { buf: Vec::new() }
    }

    /// Allocated size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// One past the highest byte of the buffer.
    #[inline]
    pub fn top(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr_range().end
    }

    /// Zero the image, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.fill(0);
    }

    /// Replace the buffer with a zeroed one of `size` bytes.
    ///
    /// The old buffer is freed first so the heap can hand the same block
    /// back. On failure the stack is left empty.
    pub fn allocate(&mut self, size: usize) -> Result<()> {
        self.buf = Vec::new();

        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| FiberError::OutOfMemory(size))?;
        buf.resize(size, 0);
        self.buf = buf;
        Ok(())
    }

    /// Grow the buffer if it cannot hold `depth` bytes of stack.
    ///
    /// Returns `true` if a new buffer was allocated.
    pub fn ensure(&mut self, depth: usize) -> Result<bool> {
        if self.size() >= depth {
            return Ok(false);
        }
        self.allocate(allocation_for(depth))?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Launch descriptor
// ---------------------------------------------------------------------------

/// What a newly created fiber runs the first time it is switched in.
///
/// A `None` completion means the fiber is simply released when its entry
/// function returns.
#[derive(Debug, Clone, Copy)]
pub enum Entry {
    Plain {
        entry: fn(),
        completion: Option<fn()>,
    },
    Param {
        entry: fn(*mut ()),
        param: *mut (),
        completion: Option<fn(*mut ())>,
    },
}

impl Entry {
    pub(crate) fn call(&self) {
        match *self {
            Entry::Plain { entry, .. } => entry(),
            Entry::Param { entry, param, .. } => entry(param),
        }
    }

    pub(crate) fn complete(&self) {
        match *self {
            Entry::Plain { completion: Some(done), .. } => done(),
            Entry::Param { completion: Some(done), param, .. } => done(param),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Fiber Control Block
// ---------------------------------------------------------------------------

/// Fiber control block.
///
/// The saved register context is deliberately not stored here: the
/// scheduler keeps it beside the table, where the port can reach it without
/// borrowing the table.
#[derive(Debug)]
pub struct Fiber {
    /// Stack image buffer.
    pub stack: Stack,

    /// Scheduler-private word: the wake tick while sleeping, the packed
    /// event filter while waiting.
    pub context: u32,

    /// `FLAG_*` bits.
    pub flags: u8,

    /// The queue this fiber is on, if any.
    pub queue: Option<QueueKind>,

    /// Links for `queue`.
    pub next: Option<FiberId>,
    pub prev: Option<FiberId>,

    /// Set between creation and first launch.
    pub entry: Option<Entry>,
}

// Safety: the only non-Send member is the untyped parameter pointer of a
// pending `Entry`, which is handed back to application code on the one core
// that created it. The table is only accessed inside critical sections.
unsafe impl Send for Fiber {}

impl Fiber {
    pub const EMPTY: Self = Self {
        stack: Stack::empty(),
        context: 0,
        flags: 0,
        queue: None,
        next: None,
        prev: None,
        entry: None,
    };

    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Return to the state of a freshly allocated fiber, keeping the stack
    /// allocation.
    fn reset(&mut self) {
        self.stack.clear();
        self.context = 0;
        self.flags = 0;
        self.entry = None;
    }
}

// ---------------------------------------------------------------------------
// Fiber table
// ---------------------------------------------------------------------------

/// Fixed arena of fiber control blocks plus the queue heads that thread
/// through it.
pub struct FiberTable {
    pub(crate) fibers: [Fiber; MAX_FIBERS],
    pub(crate) heads: [Option<FiberId>; QueueKind::COUNT],
    /// Slots `0..allocated` have been handed out at least once.
    allocated: usize,
}

impl FiberTable {
    pub const fn new() -> Self {
        Self {
            fibers: [Fiber::EMPTY; MAX_FIBERS],
            heads: [None; QueueKind::COUNT],
            allocated: 0,
        }
    }

    /// Number of control blocks ever handed out (live plus pooled).
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Obtain a clean fiber, recycling from the pool before touching a
    /// fresh slot. The returned fiber is on no queue.
    pub fn get_fiber_context(&mut self) -> Result<FiberId> {
        self.get_fiber_context_except(None)
    }

    /// As [`get_fiber_context`](Self::get_fiber_context), but never hands
    /// out `busy` even if it is pooled.
    pub fn get_fiber_context_except(&mut self, busy: Option<FiberId>) -> Result<FiberId> {
        let pooled = self.iter(QueueKind::Pool).find(|&f| Some(f) != busy);
        if let Some(f) = pooled {
            self.dequeue_fiber(f);
            self[f].reset();
            return Ok(f);
        }

        if self.allocated >= MAX_FIBERS {
            return Err(FiberError::NoFreeFiber);
        }

        let f = FiberId::new(self.allocated);
        self[f].stack.allocate(FIBER_STACK_SIZE)?;
        self[f].reset();
        self.allocated += 1;
        Ok(f)
    }

    /// Move a finished fiber to the pool.
    pub fn recycle(&mut self, f: FiberId) -> Result<()> {
        if self[f].queue == Some(QueueKind::Pool) {
            return Err(FiberError::AlreadyReleased);
        }
        self[f].flags = 0;
        self[f].context = 0;
        self[f].entry = None;
        self.queue_fiber(f, QueueKind::Pool);
        Ok(())
    }
}

impl Index<FiberId> for FiberTable {
    type Output = Fiber;

    #[inline]
    fn index(&self, f: FiberId) -> &Fiber {
        &self.fibers[f.index()]
    }
}

impl IndexMut<FiberId> for FiberTable {
    #[inline]
    fn index_mut(&mut self, f: FiberId) -> &mut Fiber {
        &mut self.fibers[f.index()]
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_rounding() {
        assert_eq!(allocation_for(0), 32);
        assert_eq!(allocation_for(1), 32);
        assert_eq!(allocation_for(31), 32);
        assert_eq!(allocation_for(32), 64);
        assert_eq!(allocation_for(100), 128);
    }

    #[test]
    fn test_stack_grows_only_when_needed() {
        let mut stack = Stack::empty();
        stack.allocate(FIBER_STACK_SIZE).unwrap();
        assert_eq!(stack.size(), 64);

        assert!(!stack.ensure(40).unwrap());
        assert!(!stack.ensure(64).unwrap());
        assert_eq!(stack.size(), 64);

        assert!(stack.ensure(65).unwrap());
        assert_eq!(stack.size(), 96);
    }

    #[test]
    fn test_stack_allocation_failure_is_reported() {
        let mut stack = Stack::empty();
        stack.allocate(FIBER_STACK_SIZE).unwrap();

        let depth = isize::MAX as usize;
        let err = stack.ensure(depth).unwrap_err();
        assert_eq!(err, FiberError::OutOfMemory(allocation_for(depth)));
        assert_eq!(stack.size(), 0);
    }

    #[test]
    fn test_fresh_fiber() {
        let mut table = FiberTable::new();
        let f = table.get_fiber_context().unwrap();
        assert_eq!(f.index(), 0);
        assert_eq!(table.allocated(), 1);
        assert_eq!(table[f].stack.size(), FIBER_STACK_SIZE);
        assert_eq!(table[f].flags, 0);
        assert_eq!(table[f].queue, None);
    }

    #[test]
    fn test_recycled_fiber_is_clean() {
        let mut table = FiberTable::new();
        let f = table.get_fiber_context().unwrap();
        table[f].stack.ensure(200).unwrap();
        table[f].flags = FLAG_CHILD;
        table[f].context = 1234;
        let top = table[f].stack.top();
        unsafe { *top.sub(1) = 0xAA };

        table.recycle(f).unwrap();
        assert_eq!(table[f].queue, Some(QueueKind::Pool));

        let g = table.get_fiber_context().unwrap();
        assert_eq!(g, f);
        assert_eq!(table.allocated(), 1);
        assert_eq!(table[g].flags, 0);
        assert_eq!(table[g].context, 0);
        assert_eq!(table[g].queue, None);
        // The larger buffer is kept, but zeroed.
        assert_eq!(table[g].stack.size(), 224);
        let top = table[g].stack.top();
        assert_eq!(unsafe { *top.sub(1) }, 0);
    }

    #[test]
    fn test_busy_fiber_not_handed_out() {
        let mut table = FiberTable::new();
        let f = table.get_fiber_context().unwrap();
        table.recycle(f).unwrap();

        let g = table.get_fiber_context_except(Some(f)).unwrap();
        assert_ne!(g, f);
        assert_eq!(table.allocated(), 2);
        assert_eq!(table[f].queue, Some(QueueKind::Pool));

        // Another pooled fiber is preferred to a fresh slot.
        table.recycle(g).unwrap();
        assert_eq!(table.get_fiber_context_except(Some(f)), Ok(g));
        assert_eq!(table.allocated(), 2);
    }

    #[test]
    fn test_double_recycle_detected() {
        let mut table = FiberTable::new();
        let f = table.get_fiber_context().unwrap();
        table.recycle(f).unwrap();
        assert_eq!(table.recycle(f), Err(FiberError::AlreadyReleased));
    }

    #[test]
    fn test_table_exhaustion() {
        let mut table = FiberTable::new();
        for _ in 0..MAX_FIBERS {
            table.get_fiber_context().unwrap();
        }
        assert_eq!(table.get_fiber_context(), Err(FiberError::NoFreeFiber));
    }

    #[test]
    fn test_entry_dispatch() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);

        fn bump(p: *mut ()) {
            let step = unsafe { *(p as *const u32) };
            CALLS.fetch_add(step, Ordering::SeqCst);
        }

        let mut step = 10u32;
        let entry = Entry::Param {
            entry: bump,
            param: &mut step as *mut u32 as *mut (),
            completion: Some(bump),
        };
        entry.call();
        entry.complete();
        assert_eq!(CALLS.load(Ordering::SeqCst), 20);
    }
}
