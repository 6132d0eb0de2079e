use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use generational_arena::Index;

use crate::clock::Tick;

/// Identifies one pending sleep. Doubles as the insertion sequence number,
/// which is what gives equal deadlines FIFO wake order.
pub type TimerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Tick,
    id: TimerId,
}

/// Deadline-ordered queue of sleeping coroutines.
///
/// Pure data structure: time is always an argument, never read here.
/// Cancellation is lazy: the heap entry stays behind and is discarded when
/// it surfaces, keeping `cancel` at one hash-map removal.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    live: HashMap<TimerId, Index>,
    next_id: TimerId,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `waiter` to wake at `deadline`.
    pub fn insert(&mut self, deadline: Tick, waiter: Index) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse(TimerEntry { deadline, id }));
        self.live.insert(id, waiter);
        id
    }

    /// Remove an entry before it fires. Returns false (a no-op) if the
    /// entry already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id).is_some()
    }

    /// Nearest pending deadline, skipping cancelled leftovers.
    pub fn peek_earliest(&mut self) -> Option<Tick> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.live.contains_key(&entry.id) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every waiter whose deadline has passed, in
    /// deadline order, insertion order on ties.
    pub fn pop_expired(&mut self, now: Tick) -> Vec<(TimerId, Index)> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = *entry;
            self.heap.pop();
            if let Some(waiter) = self.live.remove(&entry.id) {
                fired.push((entry.id, waiter));
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generational_arena::Arena;

    fn waiters(n: usize) -> Vec<Index> {
        let mut arena = Arena::new();
        (0..n).map(|_| arena.insert(())).collect()
    }

    #[test]
    fn fires_in_deadline_order() {
        let w = waiters(4);
        let mut q = TimerQueue::new();
        q.insert(30, w[0]);
        q.insert(40, w[1]);
        q.insert(10, w[2]);
        q.insert(20, w[3]);

        let fired: Vec<Index> = q.pop_expired(100).into_iter().map(|(_, c)| c).collect();
        assert_eq!(fired, vec![w[2], w[3], w[0], w[1]]);
        assert!(q.is_empty());
    }

    #[test]
    fn equal_deadlines_wake_fifo() {
        let w = waiters(3);
        let mut q = TimerQueue::new();
        q.insert(50, w[0]);
        q.insert(50, w[1]);
        q.insert(50, w[2]);

        let fired: Vec<Index> = q.pop_expired(50).into_iter().map(|(_, c)| c).collect();
        assert_eq!(fired, vec![w[0], w[1], w[2]]);
    }

    #[test]
    fn pop_expired_leaves_future_entries() {
        let w = waiters(2);
        let mut q = TimerQueue::new();
        q.insert(10, w[0]);
        q.insert(90, w[1]);

        let fired = q.pop_expired(10);
        assert_eq!(fired.len(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_earliest(), Some(90));
    }

    #[test]
    fn cancel_before_fire() {
        let w = waiters(2);
        let mut q = TimerQueue::new();
        let t0 = q.insert(10, w[0]);
        q.insert(20, w[1]);

        assert!(q.cancel(t0));
        let fired: Vec<Index> = q.pop_expired(100).into_iter().map(|(_, c)| c).collect();
        assert_eq!(fired, vec![w[1]]);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let w = waiters(1);
        let mut q = TimerQueue::new();
        let t = q.insert(10, w[0]);
        assert_eq!(q.pop_expired(10).len(), 1);
        assert!(!q.cancel(t));
        assert!(!q.cancel(t));
    }

    #[test]
    fn peek_skips_cancelled_head() {
        let w = waiters(2);
        let mut q = TimerQueue::new();
        let t0 = q.insert(10, w[0]);
        q.insert(25, w[1]);

        q.cancel(t0);
        assert_eq!(q.peek_earliest(), Some(25));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn empty_queue() {
        let mut q = TimerQueue::new();
        assert_eq!(q.peek_earliest(), None);
        assert!(q.pop_expired(1000).is_empty());
        assert!(q.is_empty());
    }
}
