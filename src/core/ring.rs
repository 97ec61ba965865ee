use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Fixed-capacity FIFO. Pushing onto a full ring evicts the oldest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append an item, returning the evicted one if the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Oldest-first copy of the contents.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::RingBuffer;

    #[test]
    fn test_ring_evicts_oldest_when_full() {
        let mut ring = RingBuffer::new(3);
        for i in 0..3 {
            assert_eq!(ring.push(i), None);
        }
        assert_eq!(ring.push(3), Some(0));
        assert_eq!(ring.to_vec(), vec![1, 2, 3]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_zero_capacity_ring_keeps_nothing() {
        let mut ring = RingBuffer::new(0);
        assert_eq!(ring.push("a"), Some("a"));
        assert!(ring.is_empty());
    }
}
