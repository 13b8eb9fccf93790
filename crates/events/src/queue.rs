//! Bounded FIFO admission queue with priority-aware overflow.
//!
//! Priority only matters when the queue is full: `Critical`/`Emergency`
//! events may evict the least important queued event. Dequeue order is
//! always FIFO among admitted events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::event::Event;

/// Successful admission outcome.
#[derive(Debug)]
pub enum Admission {
    Admitted,
    /// Admitted by forcing out a lower-priority queued event.
    AdmittedWithEviction(Box<Event>),
}

/// Queue full; the rejected event is handed back to the caller.
#[derive(Debug)]
pub struct QueueFull(pub Box<Event>);

#[derive(Debug)]
pub struct AdmissionQueue {
    capacity: usize,
    items: Mutex<VecDeque<Event>>,
    available: Notify,
    high_water: AtomicUsize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            high_water: AtomicUsize::new(0),
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

    /// Deepest the queue has been since creation.
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Admit under the overflow policy.
    ///
    /// At capacity, an urgent event evicts the lowest-priority queued event
    /// strictly below its own priority (the oldest one among equals). Anything
    /// else is rejected.
    pub fn try_admit(&self, event: Event) -> Result<Admission, QueueFull> {
        let mut items = self.items.lock();

        if items.len() < self.capacity {
            items.push_back(event);
            self.after_push(items.len());
            return Ok(Admission::Admitted);
        }

        if !event.priority.is_urgent() {
            return Err(QueueFull(Box::new(event)));
        }

        let victim = items
            .iter()
            .enumerate()
            .filter(|(_, queued)| queued.priority < event.priority)
            .min_by_key(|(idx, queued)| (queued.priority, *idx))
            .map(|(idx, _)| idx);

        match victim.and_then(|idx| items.remove(idx)) {
            Some(evicted) => {
                items.push_back(event);
                self.after_push(items.len());
                Ok(Admission::AdmittedWithEviction(Box::new(evicted)))
            }
            None => Err(QueueFull(Box::new(event))),
        }
    }

    /// Push regardless of capacity. Used for retries, which were admitted once
    /// already and must not be lost to backpressure.
    pub fn requeue(&self, event: Event) {
        let mut items = self.items.lock();
        items.push_back(event);
        self.after_push(items.len());
    }

    /// Wait up to `wait` for the next event. `None` means the wait elapsed,
    /// which lets workers check for shutdown.
    pub async fn dequeue(&self, wait: Duration) -> Option<Event> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.available.notified();
            if let Some(event) = self.items.lock().pop_front() {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.items.lock().pop_front();
            }
        }
    }

    fn after_push(&self, depth: usize) {
        self.high_water.fetch_max(depth, Ordering::Relaxed);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPriority, EventType};

    fn event(priority: EventPriority) -> Event {
        Event::new(EventType::OrderCreated, "sales").with_priority(priority)
    }

    #[tokio::test]
    async fn preserves_fifo_order_regardless_of_priority() {
        let queue = AdmissionQueue::new(8);
        let first = event(EventPriority::Low);
        let second = event(EventPriority::Emergency);
        queue.try_admit(first.clone()).unwrap();
        queue.try_admit(second.clone()).unwrap();

        let wait = Duration::from_millis(10);
        assert_eq!(queue.dequeue(wait).await.unwrap().id, first.id);
        assert_eq!(queue.dequeue(wait).await.unwrap().id, second.id);
        assert!(queue.dequeue(wait).await.is_none());
    }

    #[test]
    fn rejects_non_urgent_events_at_capacity() {
        let queue = AdmissionQueue::new(1);
        queue.try_admit(event(EventPriority::Low)).unwrap();

        let rejected = queue.try_admit(event(EventPriority::High)).unwrap_err();
        assert_eq!(rejected.0.priority, EventPriority::High);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn urgent_event_evicts_lowest_priority_oldest_first() {
        let queue = AdmissionQueue::new(3);
        let normal = event(EventPriority::Normal);
        let low_old = event(EventPriority::Low);
        let low_new = event(EventPriority::Low);
        queue.try_admit(normal.clone()).unwrap();
        queue.try_admit(low_old.clone()).unwrap();
        queue.try_admit(low_new.clone()).unwrap();

        let outcome = queue.try_admit(event(EventPriority::Critical)).unwrap();
        match outcome {
            Admission::AdmittedWithEviction(evicted) => assert_eq!(evicted.id, low_old.id),
            Admission::Admitted => panic!("expected an eviction"),
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn urgent_event_fails_when_nothing_ranks_below_it() {
        let queue = AdmissionQueue::new(1);
        queue.try_admit(event(EventPriority::Emergency)).unwrap();

        assert!(queue.try_admit(event(EventPriority::Critical)).is_err());
        assert!(queue.try_admit(event(EventPriority::Emergency)).is_err());
    }

    #[tokio::test]
    async fn requeue_ignores_capacity() {
        let queue = AdmissionQueue::new(1);
        queue.try_admit(event(EventPriority::Normal)).unwrap();
        queue.requeue(event(EventPriority::Normal));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.high_water_mark(), 2);
    }

    #[tokio::test]
    async fn dequeue_wakes_up_on_push() {
        let queue = std::sync::Arc::new(AdmissionQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let pushed = event(EventPriority::Normal);
        queue.try_admit(pushed.clone()).unwrap();

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.id, pushed.id);
    }
}
