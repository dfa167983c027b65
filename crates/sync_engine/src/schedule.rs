//! Bounded, time-ordered activation schedule
//!
//! Min-heap keyed by `execute_at`; events sharing a deadline leave in
//! insertion order. Capacity is fixed at construction and never grows.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use contracts::{CapacityError, MotorEvent};

#[derive(Debug, Clone, Copy)]
struct Entry {
    execute_at: u64,
    /// Insertion counter, breaks deadline ties
    seq: u64,
    event: MotorEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
pub struct ActivationSchedule {
    heap: BinaryHeap<Reverse<Entry>>,
    capacity: usize,
    next_seq: u64,
}

impl ActivationSchedule {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Insert an event; fails without modifying the schedule when full
    pub fn enqueue(&mut self, event: MotorEvent) -> Result<(), CapacityError> {
        if self.heap.len() >= self.capacity {
            return Err(CapacityError::full(self.capacity));
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse(Entry {
            execute_at: event.execute_at,
            seq,
            event,
        }));
        Ok(())
    }

    pub fn peek_next(&self) -> Option<&MotorEvent> {
        self.heap.peek().map(|Reverse(entry)| &entry.event)
    }

    pub fn dequeue_next(&mut self) -> Option<MotorEvent> {
        self.heap.pop().map(|Reverse(entry)| entry.event)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(entry)| entry.execute_at)
    }

    /// Pop the earliest event if its deadline is at or before `now_us`
    pub fn dequeue_due(&mut self, now_us: u64) -> Option<MotorEvent> {
        match self.next_deadline() {
            Some(at) if at <= now_us => self.dequeue_next(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left
    pub fn remaining(&self) -> usize {
        self.capacity - self.heap.len()
    }
}
