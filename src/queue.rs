//! # Fiber Queues
//!
//! Run, sleep, wait and pool queues are all the same structure: a doubly
//! linked list threaded through the fiber table by handle, with its head in
//! [`FiberTable::heads`]. Insertion is always at the head, so walking a
//! queue visits the most recently inserted fiber first.
//!
//! None of these operations allocate, which is what lets the tick and event
//! handlers move fibers around from interrupt context.

use crate::fiber::{FiberId, FiberTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Fibers eligible to run. The current fiber stays on it while running.
    Run,
    /// Fibers blocked until a tick count.
    Sleep,
    /// Fibers blocked until a matching event.
    Wait,
    /// Completed fibers waiting to be recycled.
    Pool,
}

impl QueueKind {
    pub(crate) const COUNT: usize = 4;

    #[inline]
    const fn slot(self) -> usize {
        self as usize
    }
}

impl FiberTable {
    #[inline]
    pub fn head(&self, queue: QueueKind) -> Option<FiberId> {
        self.heads[queue.slot()]
    }

    #[inline]
    pub fn is_empty(&self, queue: QueueKind) -> bool {
        self.head(queue).is_none()
    }

    /// Insert `f` at the head of `queue`.
    ///
    /// A fiber that is already queued is moved, so a fiber is never on two
    /// queues.
    pub fn queue_fiber(&mut self, f: FiberId, queue: QueueKind) {
        self.dequeue_fiber(f);

        let head = self.heads[queue.slot()];
        if let Some(h) = head {
            self[h].prev = Some(f);
        }

        let fiber = &mut self[f];
        fiber.queue = Some(queue);
        fiber.next = head;
        fiber.prev = None;
        self.heads[queue.slot()] = Some(f);
    }

    /// Unlink `f` from whichever queue it is on. No-op if it is on none.
    pub fn dequeue_fiber(&mut self, f: FiberId) {
        let Some(queue) = self[f].queue else {
            return;
        };
        let (prev, next) = (self[f].prev, self[f].next);

        match prev {
            Some(p) => self[p].next = next,
            None => self.heads[queue.slot()] = next,
        }
        if let Some(n) = next {
            self[n].prev = prev;
        }

        let fiber = &mut self[f];
        fiber.queue = None;
        fiber.next = None;
        fiber.prev = None;
    }

    /// Walk `queue` from its head.
    pub fn iter(&self, queue: QueueKind) -> Iter<'_> {
        Iter {
            table: self,
            cursor: self.head(queue),
        }
    }
}

pub struct Iter<'a> {
    table: &'a FiberTable,
    cursor: Option<FiberId>,
}

impl Iterator for Iter<'_> {
    type Item = FiberId;

    fn next(&mut self) -> Option<FiberId> {
        let f = self.cursor?;
        self.cursor = self.table[f].next;
        Some(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    const ALL: [QueueKind; QueueKind::COUNT] =
        [QueueKind::Run, QueueKind::Sleep, QueueKind::Wait, QueueKind::Pool];

    fn table_with(n: usize) -> (FiberTable, Vec<FiberId>) {
        let mut table = FiberTable::new();
        let ids = (0..n).map(|_| table.get_fiber_context().unwrap()).collect();
        (table, ids)
    }

    fn members(table: &FiberTable, q: QueueKind) -> Vec<FiberId> {
        table.iter(q).collect()
    }

    /// Every fiber's `queue` field agrees with reachability from exactly one
    /// head, and the back links mirror the forward links.
    fn assert_consistent(table: &FiberTable, ids: &[FiberId]) {
        for &f in ids {
            let found: Vec<QueueKind> = ALL
                .iter()
                .copied()
                .filter(|&q| table.iter(q).any(|g| g == f))
                .collect();
            match table[f].queue {
                Some(q) => assert_eq!(found, [q], "{} misfiled", f),
                None => assert!(found.is_empty(), "{} reachable but unqueued", f),
            }
        }
        for q in ALL {
            let mut prev = None;
            for f in table.iter(q) {
                assert_eq!(table[f].prev, prev);
                prev = Some(f);
            }
        }
    }

    #[test]
    fn test_head_insertion_order() {
        let (mut table, ids) = table_with(3);
        for &f in &ids {
            table.queue_fiber(f, QueueKind::Run);
        }
        assert_eq!(members(&table, QueueKind::Run), [ids[2], ids[1], ids[0]]);
        assert_consistent(&table, &ids);
    }

    #[test]
    fn test_dequeue_head_middle_tail() {
        let (mut table, ids) = table_with(4);
        for &f in &ids {
            table.queue_fiber(f, QueueKind::Wait);
        }
        // Wait: 3 2 1 0
        table.dequeue_fiber(ids[2]);
        assert_eq!(members(&table, QueueKind::Wait), [ids[3], ids[1], ids[0]]);
        table.dequeue_fiber(ids[3]);
        assert_eq!(members(&table, QueueKind::Wait), [ids[1], ids[0]]);
        table.dequeue_fiber(ids[0]);
        assert_eq!(members(&table, QueueKind::Wait), [ids[1]]);
        table.dequeue_fiber(ids[1]);
        assert!(table.is_empty(QueueKind::Wait));
        assert_consistent(&table, &ids);
    }

    #[test]
    fn test_dequeue_unqueued_is_noop() {
        let (mut table, ids) = table_with(2);
        table.queue_fiber(ids[0], QueueKind::Sleep);
        table.dequeue_fiber(ids[1]);
        table.dequeue_fiber(ids[1]);
        assert_eq!(members(&table, QueueKind::Sleep), [ids[0]]);
        assert_consistent(&table, &ids);
    }

    #[test]
    fn test_requeue_moves_between_queues() {
        let (mut table, ids) = table_with(3);
        for &f in &ids {
            table.queue_fiber(f, QueueKind::Run);
        }
        table.queue_fiber(ids[1], QueueKind::Sleep);
        table.queue_fiber(ids[1], QueueKind::Wait);
        assert_eq!(members(&table, QueueKind::Run), [ids[2], ids[0]]);
        assert!(table.is_empty(QueueKind::Sleep));
        assert_eq!(members(&table, QueueKind::Wait), [ids[1]]);

        // Re-inserting into the same queue moves the fiber to the head.
        table.queue_fiber(ids[0], QueueKind::Run);
        assert_eq!(members(&table, QueueKind::Run), [ids[0], ids[2]]);
        assert_consistent(&table, &ids);
    }

    #[test]
    fn test_invariant_under_mixed_operations() {
        let (mut table, ids) = table_with(6);
        // A fixed but irregular sequence of moves across every queue.
        for step in 0..60usize {
            let f = ids[(step * 7 + 3) % ids.len()];
            if step % 5 == 4 {
                table.dequeue_fiber(f);
            } else {
                table.queue_fiber(f, ALL[(step * 3) % ALL.len()]);
            }
            assert_consistent(&table, &ids);
        }
    }
}
