//! FIFO work queue between the listener and the sender thread
//!
//! Producers push and wake the consumer. The consumer sleeps only while
//! the queue is empty and not shutting down. After shutdown it keeps
//! receiving until the queue is drained, then gets `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::NetworkError;

struct QueueState<T> {
    items: VecDeque<T>,
    shutting_down: bool,
}

/// Multi-producer single-consumer blocking queue
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    pushed: AtomicUsize,
    popped: AtomicUsize,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutting_down: false,
            }),
            available: Condvar::new(),
            pushed: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
        }
    }

    /// Append an item. Fails once shutdown has begun.
    pub fn push(&self, item: T) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(NetworkError::QueueClosed);
        }
        state.items.push_back(item);
        drop(state);

        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        Ok(())
    }

    /// Next item, waiting while empty. `None` once shut down and drained.
    pub fn pop_blocking(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.popped.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            if state.shutting_down {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Next item without waiting
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Stop accepting items and wake the consumer
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.available.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items pushed
    pub fn pushed_count(&self) -> usize {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total items handed to the consumer
    pub fn popped_count(&self) -> usize {
        self.popped.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a work queue
pub type SharedWorkQueue<T> = Arc<WorkQueue<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_blocking(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.pop_blocking(), Some(3));
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.pushed_count(), 3);
        assert_eq!(queue.popped_count(), 3);
    }

    #[test]
    fn test_shutdown_drains_then_stops() {
        let queue = WorkQueue::new();
        queue.push("a").unwrap();
        queue.shutdown();

        assert!(matches!(queue.push("b"), Err(NetworkError::QueueClosed)));
        assert_eq!(queue.pop_blocking(), Some("a"));
        assert_eq!(queue.pop_blocking(), None);
    }

    #[test]
    fn test_consumer_wakes_on_push_and_shutdown() {
        let queue: SharedWorkQueue<u32> = Arc::new(WorkQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop_blocking() {
                    seen.push(item);
                }
                seen
            })
        };

        thread::sleep(Duration::from_millis(20));
        for i in 0..100 {
            queue.push(i).unwrap();
        }
        queue.shutdown();

        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_many_producers() {
        let queue: SharedWorkQueue<usize> = Arc::new(WorkQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        queue.shutdown();

        let mut count = 0;
        while queue.pop_blocking().is_some() {
            count += 1;
        }
        assert_eq!(count, 1000);
    }
}
