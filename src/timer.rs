// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    scheduler::ready::Work,
    SharedObject,
};
use ::core::cmp::Reverse;
use ::std::{
    collections::BinaryHeap,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct TimerEntry {
    deadline: Instant,
    /// Tie-break: entries with equal deadlines surface in insertion order.
    sequence: u64,
    work: Work,
    handle: TimerHandle,
}

/// Cancellation handle for a timer entry. Cancelled entries are dropped lazily when they surface at the heap top;
/// cancelling after the entry has already moved to the ready queue is too late.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: SharedObject<bool>,
}

/// Time-deferred work, retrievable in `(deadline, sequence)` order.
pub struct TimerQueue {
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_sequence: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimerHandle {
    fn new() -> Self {
        Self {
            cancelled: SharedObject::new(false),
        }
    }

    pub fn cancel(&mut self) {
        *self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Registers `work` to become ready at `deadline` and returns its cancellation handle.
    pub fn insert(&mut self, deadline: Instant, work: Work) -> TimerHandle {
        let handle: TimerHandle = TimerHandle::new();
        let sequence: u64 = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            sequence,
            work,
            handle: handle.clone(),
        }));
        handle
    }

    /// Removes every live entry whose deadline is at or before `now`, in `(deadline, sequence)` order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Work> {
        let mut due: Vec<Work> = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if now < entry.deadline {
                break;
            }
            let entry: TimerEntry = self
                .heap
                .pop()
                .expect("should have an entry because we were able to peek")
                .0;
            if entry.handle.is_cancelled() {
                trace!("pop_due(): dropping cancelled entry (sequence={:?})", entry.sequence);
                continue;
            }
            due.push(entry.work);
        }
        due
    }

    /// Earliest live deadline, purging cancelled entries off the top of the heap.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if !entry.handle.is_cancelled() {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> core::cmp::Ordering {
        // Order by deadline, with the insertion sequence as a FIFO tie-break.
        self.deadline
            .cmp(&other.deadline)
            .then(self.sequence.cmp(&other.sequence))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::TimerQueue;
    use crate::scheduler::ready::Work;
    use ::anyhow::Result;
    use ::std::{
        cell::RefCell,
        rc::Rc,
        time::{
            Duration,
            Instant,
        },
    };

    fn record(order: &Rc<RefCell<Vec<usize>>>, value: usize) -> Work {
        let order: Rc<RefCell<Vec<usize>>> = order.clone();
        Work::Callback(Box::new(move || {
            order.borrow_mut().push(value);
            Ok(())
        }))
    }

    fn run_all(due: Vec<Work>) {
        for work in due {
            if let Work::Callback(callback) = work {
                callback().unwrap();
            }
        }
    }

    #[test]
    fn entries_surface_in_deadline_order() -> Result<()> {
        let mut timers: TimerQueue = TimerQueue::new();
        let now: Instant = Instant::now();
        let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        timers.insert(now + Duration::from_millis(100), record(&order, 100));
        timers.insert(now + Duration::from_millis(50), record(&order, 50));
        timers.insert(now + Duration::from_millis(75), record(&order, 75));

        crate::ensure_eq!(timers.next_deadline(), Some(now + Duration::from_millis(50)));
        run_all(timers.pop_due(now + Duration::from_millis(100)));
        crate::ensure_eq!(*order.borrow(), vec![50, 75, 100]);
        crate::ensure_eq!(timers.next_deadline(), None);
        Ok(())
    }

    #[test]
    fn equal_deadlines_preserve_insertion_order() -> Result<()> {
        let mut timers: TimerQueue = TimerQueue::new();
        let deadline: Instant = Instant::now() + Duration::from_millis(10);
        let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        for i in 0..5 {
            timers.insert(deadline, record(&order, i));
        }
        run_all(timers.pop_due(deadline));
        crate::ensure_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn entries_before_their_deadline_stay_queued() -> Result<()> {
        let mut timers: TimerQueue = TimerQueue::new();
        let now: Instant = Instant::now();
        let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        timers.insert(now + Duration::from_millis(20), record(&order, 20));
        run_all(timers.pop_due(now + Duration::from_millis(10)));
        crate::ensure_eq!(order.borrow().is_empty(), true);

        run_all(timers.pop_due(now + Duration::from_millis(20)));
        crate::ensure_eq!(*order.borrow(), vec![20]);
        Ok(())
    }

    #[test]
    fn cancelled_entries_never_fire() -> Result<()> {
        let mut timers: TimerQueue = TimerQueue::new();
        let now: Instant = Instant::now();
        let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        let mut handle = timers.insert(now + Duration::from_millis(5), record(&order, 5));
        timers.insert(now + Duration::from_millis(10), record(&order, 10));
        handle.cancel();

        // The cancelled entry neither counts as a deadline nor fires.
        crate::ensure_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        run_all(timers.pop_due(now + Duration::from_millis(10)));
        crate::ensure_eq!(*order.borrow(), vec![10]);
        Ok(())
    }
}
