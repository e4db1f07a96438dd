//! Wait queue ordered by aging, priority and submission order

use ember_types::{Priority, RequestId};
use priority_queue::PriorityQueue;
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

/// Queue key; greater keys pop first.
///
/// Aged requests outrank everything else and run in submission order among
/// themselves. The rest go by higher priority, then older submission (smaller
/// sequence number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueKey {
    aged: bool,
    priority: Priority,
    seq: Reverse<u64>,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.aged, other.aged) {
            (true, true) => self
                .seq
                .cmp(&other.seq)
                .then(self.priority.cmp(&other.priority)),
            (false, false) => self
                .priority
                .cmp(&other.priority)
                .then(self.seq.cmp(&other.seq)),
            (aged, _) => aged.cmp(&other.aged),
        }
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl QueueKey {
    pub fn new(priority: Priority, seq: u64) -> Self {
        Self {
            aged: false,
            priority,
            seq: Reverse(seq),
        }
    }

    pub fn is_aged(&self) -> bool {
        self.aged
    }

    pub fn seq(&self) -> u64 {
        self.seq.0
    }
}

/// Requests waiting for admission
#[derive(Debug)]
pub struct WaitQueue {
    queue: PriorityQueue<RequestId, QueueKey>,
    enqueued_at: HashMap<RequestId, u64>,
    max_size: usize,
}

impl WaitQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: PriorityQueue::new(),
            enqueued_at: HashMap::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.queue.get(&id).is_some()
    }

    /// Enqueue a new request at `cycle`; false when full
    pub fn push(&mut self, id: RequestId, key: QueueKey, cycle: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push(id, key);
        self.enqueued_at.insert(id, cycle);
        true
    }

    /// Put back a request taken with [`Self::pop`], keeping its place
    pub fn requeue(&mut self, id: RequestId, key: QueueKey) {
        self.queue.push(id, key);
    }

    pub fn pop(&mut self) -> Option<(RequestId, QueueKey)> {
        self.queue.pop()
    }

    /// Forget a request entirely
    pub fn remove(&mut self, id: RequestId) -> bool {
        self.enqueued_at.remove(&id);
        self.queue.remove(&id).is_some()
    }

    /// Called once the request leaves the queue for good
    pub fn admitted(&mut self, id: RequestId) {
        self.enqueued_at.remove(&id);
    }

    /// Cycles `id` has been waiting
    pub fn waited(&self, id: RequestId, cycle: u64) -> u64 {
        self.enqueued_at
            .get(&id)
            .map(|&at| cycle.saturating_sub(at))
            .unwrap_or(0)
    }

    /// Promote every request that has waited more than `max_wait` cycles.
    ///
    /// Returns how many were promoted this call.
    pub fn promote_aged(&mut self, cycle: u64, max_wait: u64) -> usize {
        let due: Vec<RequestId> = self
            .queue
            .iter()
            .filter(|(id, key)| !key.aged && self.waited(**id, cycle) > max_wait)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            if let Some(key) = self.queue.get_priority(id).copied() {
                self.queue.change_priority(id, QueueKey { aged: true, ..key });
            }
        }
        due.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.queue.iter().map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> RequestId {
        RequestId::new(n)
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut q = WaitQueue::new(8);
        q.push(id(1), QueueKey::new(Priority::Normal, 1), 0);
        q.push(id(2), QueueKey::new(Priority::Normal, 2), 0);
        q.push(id(3), QueueKey::new(Priority::High, 3), 0);

        assert_eq!(q.pop().map(|(i, _)| i), Some(id(3)));
        assert_eq!(q.pop().map(|(i, _)| i), Some(id(1)));
        assert_eq!(q.pop().map(|(i, _)| i), Some(id(2)));
        assert!(q.is_empty());
    }

    #[test]
    fn test_aged_request_jumps_priority() {
        let mut q = WaitQueue::new(8);
        q.push(id(1), QueueKey::new(Priority::Low, 1), 0);
        q.push(id(2), QueueKey::new(Priority::Critical, 2), 5);

        assert_eq!(q.promote_aged(6, 6), 0);
        assert_eq!(q.promote_aged(7, 6), 1);

        let (first, key) = q.pop().unwrap();
        assert_eq!(first, id(1));
        assert!(key.is_aged());
    }

    #[test]
    fn test_aged_requests_keep_submission_order() {
        let mut q = WaitQueue::new(8);
        q.push(id(1), QueueKey::new(Priority::Low, 1), 0);
        q.push(id(2), QueueKey::new(Priority::High, 2), 1);
        q.push(id(3), QueueKey::new(Priority::Critical, 3), 19);

        assert_eq!(q.promote_aged(20, 6), 2);

        assert_eq!(q.pop().map(|(i, _)| i), Some(id(1)));
        assert_eq!(q.pop().map(|(i, _)| i), Some(id(2)));
        let (last, key) = q.pop().unwrap();
        assert_eq!(last, id(3));
        assert!(!key.is_aged());
    }

    #[test]
    fn test_requeue_keeps_order() {
        let mut q = WaitQueue::new(8);
        q.push(id(1), QueueKey::new(Priority::Normal, 1), 0);
        q.push(id(2), QueueKey::new(Priority::Normal, 2), 0);

        let (head, key) = q.pop().unwrap();
        q.requeue(head, key);
        assert_eq!(q.pop().map(|(i, _)| i), Some(id(1)));
    }

    #[test]
    fn test_capacity_and_remove() {
        let mut q = WaitQueue::new(1);
        assert!(q.push(id(1), QueueKey::new(Priority::Normal, 1), 0));
        assert!(!q.push(id(2), QueueKey::new(Priority::Normal, 2), 0));
        assert!(q.contains(id(1)));
        assert!(q.remove(id(1)));
        assert!(!q.remove(id(1)));
        assert_eq!(q.waited(id(1), 10), 0);
    }
}
