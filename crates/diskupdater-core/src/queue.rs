//! Blocking FIFO shared between the event context and the mount worker.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Multi-producer, single-consumer queue with a priority lane at the front.
#[derive(Debug)]
pub struct JobQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Queue `item` ahead of everything already waiting.
    pub fn push_front(&self, item: T) {
        self.lock().push_front(item);
        self.ready.notify_one();
    }

    /// Block until an item is available and return it.
    pub fn pop(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self
                .ready
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // poisoning is ignored: no operation leaves the deque half-updated
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn front_lane_jumps_the_line() {
        let queue = JobQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        queue.push_front(0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), 0);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_blocks_until_an_item_arrives() {
        let queue = Arc::new(JobQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.push_back("mount");
        assert_eq!(consumer.join().unwrap(), "mount");
    }
}
