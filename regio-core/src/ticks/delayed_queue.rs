//! A tick-ordered queue of delayed work.

use std::collections::BinaryHeap;

use super::{Scheduled, TaskPriority};

/// Work waiting for a tick counter to reach its trigger tick.
///
/// Entries due on the same tick pop in priority order, then in the order they were scheduled.
pub struct DelayedQueue<T> {
    heap: BinaryHeap<Scheduled<T>>,
    next_order: u64,
}

impl<T> DelayedQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_order: 0,
        }
    }

    /// Schedules `payload` with normal priority to become due on `trigger_tick`.
    pub fn schedule(&mut self, payload: T, trigger_tick: u64) {
        self.schedule_with_priority(payload, trigger_tick, TaskPriority::Normal);
    }

    /// Schedules `payload` to become due on `trigger_tick`.
    pub fn schedule_with_priority(
        &mut self,
        payload: T,
        trigger_tick: u64,
        priority: TaskPriority,
    ) {
        let order = self.next_order;
        self.next_order += 1;
        self.heap
            .push(Scheduled::with_priority(payload, trigger_tick, priority, order));
    }

    /// The trigger tick of the next entry, if any.
    #[must_use]
    pub fn next_trigger(&self) -> Option<u64> {
        self.heap.peek().map(|entry| entry.trigger_tick)
    }

    /// Removes and returns the next entry if it is due on or before `tick`.
    pub fn pop_due(&mut self, tick: u64) -> Option<T> {
        if self.next_trigger()? <= tick {
            self.heap.pop().map(|entry| entry.payload)
        } else {
            None
        }
    }

    /// Removes every entry, earliest first.
    pub fn drain_ordered(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            out.push(entry.payload);
        }
        out
    }

    /// Returns the number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Moves every entry of `other` into this queue.
    ///
    /// `offset` converts `other`'s tick counter into this queue's tick counter. The relative order
    /// of `other`'s entries is kept. Triggers that would go negative clamp to zero, which makes
    /// them due on the next poll.
    pub fn absorb(&mut self, mut other: Self, offset: i64) {
        while let Some(entry) = other.heap.pop() {
            let trigger = entry.trigger_tick.saturating_add_signed(offset);
            self.schedule_with_priority(entry.payload, trigger, entry.priority);
        }
    }

    /// Partitions the queue into `parts` queues using `assign`, keeping trigger ticks and order.
    ///
    /// # Panics
    /// Panics if `assign` returns an index `>= parts`.
    pub fn split<F>(mut self, parts: usize, mut assign: F) -> Vec<Self>
    where
        F: FnMut(&T) -> usize,
    {
        let mut out: Vec<Self> = (0..parts).map(|_| Self::new()).collect();
        while let Some(entry) = self.heap.pop() {
            let index = assign(&entry.payload);
            out[index].schedule_with_priority(entry.payload, entry.trigger_tick, entry.priority);
        }
        out
    }
}

impl<T> Default for DelayedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_respects_trigger() {
        let mut queue = DelayedQueue::new();
        queue.schedule("late", 10);
        queue.schedule("early", 5);

        assert_eq!(queue.pop_due(4), None);
        assert_eq!(queue.pop_due(5), Some("early"));
        assert_eq!(queue.pop_due(9), None);
        assert_eq!(queue.pop_due(12), Some("late"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_tick_is_fifo() {
        let mut queue = DelayedQueue::new();
        for i in 0..5 {
            queue.schedule(i, 3);
        }
        assert_eq!(queue.drain_ordered(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_priority_beats_submission_order() {
        let mut queue = DelayedQueue::new();
        queue.schedule("normal", 1);
        queue.schedule_with_priority("urgent", 1, TaskPriority::VeryHigh);
        assert_eq!(queue.pop_due(1), Some("urgent"));
        assert_eq!(queue.pop_due(1), Some("normal"));
    }

    #[test]
    fn test_absorb_shifts_into_target_clock() {
        // Source region is at tick 100, target at tick 40: offset is -60.
        let mut target = DelayedQueue::new();
        target.schedule("target", 45);

        let mut source = DelayedQueue::new();
        source.schedule("source-a", 103);
        source.schedule("source-b", 103);
        source.schedule("overdue", 20);

        target.absorb(source, 40 - 100);

        assert_eq!(target.pop_due(40), Some("overdue"));
        assert_eq!(target.pop_due(43), Some("source-a"));
        assert_eq!(target.pop_due(43), Some("source-b"));
        assert_eq!(target.pop_due(44), None);
        assert_eq!(target.pop_due(45), Some("target"));
    }

    #[test]
    fn test_split_keeps_order_per_part() {
        let mut queue = DelayedQueue::new();
        for i in 0..6u32 {
            queue.schedule(i, 7);
        }

        let mut parts = queue.split(2, |value| (*value % 2) as usize);
        assert_eq!(parts[0].drain_ordered(), vec![0, 2, 4]);
        assert_eq!(parts[1].drain_ordered(), vec![1, 3, 5]);
    }
}
