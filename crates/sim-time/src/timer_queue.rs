use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use crate::Tick;

/// Handle returned by [`TimerQueue::schedule`]; used to cancel a pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// An event popped from the queue once its deadline has been reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent<T> {
    pub id: TimerId,
    pub deadline: Tick,
    pub payload: T,
}

#[derive(Debug)]
struct Entry<T> {
    deadline: Tick,
    id: TimerId,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.id) == (other.deadline, other.id)
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

/// One-shot event queue ordered by deadline.
///
/// Events with equal deadlines pop in scheduling order. Cancellation is lazy:
/// cancelled ids are remembered and skipped when they reach the head.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    cancelled: BTreeSet<TimerId>,
    next_id: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: BTreeSet::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Tick, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        tracing::trace!(?id, deadline, "timer scheduled");
        self.heap.push(Reverse(Entry {
            deadline,
            id,
            payload,
        }));
        id
    }

    /// Cancel a pending event. Cancelling an id that already fired is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if self.heap.iter().any(|Reverse(e)| e.id == id) {
            self.cancelled.insert(id);
        }
    }

    /// Deadline of the earliest live event.
    pub fn next_deadline(&mut self) -> Option<Tick> {
        self.discard_cancelled_head();
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Pop the earliest live event if its deadline is `<= now`.
    pub fn pop_due(&mut self, now: Tick) -> Option<TimerEvent<T>> {
        self.discard_cancelled_head();
        if self.heap.peek()?.0.deadline > now {
            return None;
        }
        let Reverse(e) = self.heap.pop()?;
        Some(TimerEvent {
            id: e.id,
            deadline: e.deadline,
            payload: e.payload,
        })
    }

    /// Number of live (not cancelled) events.
    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.cancelled.clear();
    }

    fn discard_cancelled_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if !self.cancelled.remove(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
