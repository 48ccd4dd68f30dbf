//! Bounded packet FIFO shared between the worker and external producers
//!
//! Overflow evicts the oldest entries so the newest audio survives.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Bounded FIFO that drops its oldest entries on overflow
#[derive(Debug)]
pub struct PacketQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> PacketQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Appends `item`, evicting the oldest entries if full
    ///
    /// Returns how many entries were dropped.
    pub fn push(&self, item: T) -> usize {
        let mut queue = self.lock();
        let mut dropped = 0;
        while queue.len() >= self.capacity {
            queue.pop_front();
            dropped += 1;
        }
        queue.push_back(item);
        dropped
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Runs `f` on the oldest entry without removing it
    pub fn with_front<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock().front_mut().map(f)
    }

    /// Removes every entry, returning how many were discarded
    pub fn flush(&self) -> usize {
        let mut queue = self.lock();
        let n = queue.len();
        queue.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new(4);
        for i in 0..3 {
            assert_eq!(queue.push(i), 0);
        }
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = PacketQueue::new(28);
        let mut dropped = 0;
        for i in 0..31 {
            dropped += queue.push(i);
            assert!(queue.len() <= queue.capacity());
        }
        assert_eq!(dropped, 3);
        assert_eq!(queue.len(), 28);
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_with_front_mutates_in_place() {
        let queue = PacketQueue::new(2);
        queue.push(vec![1, 2, 3]);
        let removed = queue.with_front(|v| v.remove(0));
        assert_eq!(removed, Some(1));
        assert_eq!(queue.pop(), Some(vec![2, 3]));
    }

    #[test]
    fn test_flush_counts() {
        let queue = PacketQueue::new(8);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.flush(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.flush(), 0);
    }
}
