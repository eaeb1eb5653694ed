//! Deadline-ordered scheduling of reconnect attempts.
//!
//! The pool never sleeps per-peer; instead every pending reconnect is a
//! [`Deadline`] in one priority queue, and each timer tick pops whatever
//! has come due. Deadlines for peers that were removed in the meantime
//! are discarded lazily at pop time.

use {
    crate::connections::PeerId,
    std::{cmp::Reverse, collections::BinaryHeap, time::Instant},
};

/// A scheduled reconnect attempt for one peer.
///
/// Ordering is by due time first (ties broken by peer id), so a min-view
/// over these pops the earliest deadline, never an arbitrary or latest
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Deadline {
    /// When the attempt becomes due.
    pub due: Instant,
    /// The peer to act on.
    pub peer: PeerId,
}

/// Pending reconnect deadlines, popped strictly earliest-first.
#[derive(Debug, Default)]
pub(crate) struct DeadlineQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
}

impl DeadlineQueue {
    pub fn push(&mut self, peer: PeerId, due: Instant) {
        self.heap.push(Reverse(Deadline { due, peer }));
    }

    /// Pop the next deadline if it is due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Deadline> {
        let Reverse(head) = self.heap.peek()?;
        if head.due <= now {
            self.heap.pop().map(|Reverse(deadline)| deadline)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    fn id(n: u64) -> PeerId {
        PeerId::from_raw(n)
    }

    #[test]
    fn test_pops_earliest_first() {
        // Insert out of order and verify pops come back in strict due-time
        // order. A max-oriented queue (or one comparing the wrong way)
        // would return the latest deadline here.
        let base = Instant::now();
        let mut queue = DeadlineQueue::default();
        for offset_ms in [700u64, 50, 300, 900, 120, 5, 480] {
            queue.push(id(offset_ms), base.checked_add(Duration::from_millis(offset_ms)).unwrap());
        }

        let far_future = base.checked_add(Duration::from_secs(60)).unwrap();
        let mut popped = Vec::new();
        while let Some(deadline) = queue.pop_due(far_future) {
            popped.push(deadline.due);
        }
        assert_eq!(popped.len(), 7);
        for pair in popped.windows(2) {
            assert!(pair[0] <= pair[1], "deadlines popped out of order");
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_due_respects_now() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::default();
        queue.push(id(1), base.checked_add(Duration::from_secs(5)).unwrap());
        queue.push(id(2), base);

        // Only the already-due entry comes out.
        assert_eq!(queue.pop_due(base).map(|d| d.peer), Some(id(2)));
        assert_eq!(queue.pop_due(base), None);
        assert_eq!(queue.len(), 1);

        let later = base.checked_add(Duration::from_secs(6)).unwrap();
        assert_eq!(queue.pop_due(later).map(|d| d.peer), Some(id(1)));
    }

    #[test]
    fn test_duplicate_due_times_all_pop() {
        let base = Instant::now();
        let mut queue = DeadlineQueue::default();
        for n in 0..4u64 {
            queue.push(id(n), base);
        }
        let mut peers: Vec<_> =
            std::iter::from_fn(|| queue.pop_due(base).map(|d| d.peer)).collect();
        peers.sort();
        assert_eq!(peers, vec![id(0), id(1), id(2), id(3)]);
    }
}
