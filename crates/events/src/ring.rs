//! Fixed-capacity, thread-safe ring buffer (append at the back, evict from the front).

use std::collections::VecDeque;

use parking_lot::Mutex;

#[derive(Debug)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append, returning the oldest entry if it had to be evicted.
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = self.items.lock();
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    /// Remove and return the oldest entry matching `pred`.
    pub fn take_first(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut items = self.items.lock();
        let idx = items.iter().position(pred)?;
        items.remove(idx)
    }

    pub fn count_where(&self, pred: impl Fn(&T) -> bool) -> usize {
        self.items.lock().iter().filter(|item| pred(item)).count()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Drop everything, returning how many entries were removed.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let n = items.len();
        items.clear();
        n
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Oldest-first copy of the current contents.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }

    /// Newest-first copy of at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        self.items.lock().iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn evicts_oldest_when_full() {
        let ring = RingBuffer::new(2);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), Some(1));
        assert_eq!(ring.snapshot(), vec![2, 3]);
        assert_eq!(ring.recent(1), vec![3]);
    }

    #[test]
    fn take_first_removes_only_the_oldest_match() {
        let ring = RingBuffer::new(5);
        for n in [1, 2, 3, 2] {
            ring.push(n);
        }
        assert_eq!(ring.take_first(|n| *n == 2), Some(2));
        assert_eq!(ring.snapshot(), vec![1, 3, 2]);
        assert_eq!(ring.take_first(|n| *n == 9), None);
    }

    #[test]
    fn drain_empties_in_order() {
        let ring = RingBuffer::new(3);
        for n in [1, 2, 3] {
            ring.push(n);
        }
        assert_eq!(ring.drain(), vec![1, 2, 3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let ring = RingBuffer::new(0);
        ring.push("a");
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.len(), 1);
    }

    proptest! {
        #[test]
        fn keeps_the_last_capacity_items(cap in 1usize..32, items in proptest::collection::vec(any::<u16>(), 0..128)) {
            let ring = RingBuffer::new(cap);
            for item in &items {
                ring.push(*item);
            }

            let start = items.len().saturating_sub(cap);
            prop_assert_eq!(ring.snapshot(), items[start..].to_vec());
            prop_assert!(ring.len() <= cap);
        }
    }
}
