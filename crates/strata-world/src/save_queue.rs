//! Unbounded FIFO of pending save tasks with a cancellable blocking take.
//!
//! The stop signal is a second channel whose only sender is dropped by
//! [`SaveQueue::interrupt`]; a disconnected stop channel wakes any blocked
//! [`SaveQueue::take`] and keeps every later call from blocking.

use crossbeam_channel::{select, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

/// Result of a blocking take.
#[derive(Debug)]
pub enum Take<T> {
    /// A task was dequeued.
    Task(T),
    /// The wait was interrupted by the stop signal.
    Interrupted,
}

/// Thread-safe FIFO shared by producers and the persistence worker.
#[derive(Debug)]
pub struct SaveQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl<T> Default for SaveQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SaveQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        Self {
            tx,
            rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        }
    }

    /// Appends a task to the tail. Never blocks.
    pub fn submit(&self, task: T) {
        // Both channel ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(task);
    }

    /// Blocks until a task is available or the queue is interrupted.
    pub fn take(&self) -> Take<T> {
        if self.is_interrupted() {
            return Take::Interrupted;
        }
        select! {
            recv(self.stop_rx) -> _ => Take::Interrupted,
            recv(self.rx) -> task => match task {
                Ok(task) => Take::Task(task),
                Err(_) => Take::Interrupted,
            },
        }
    }

    /// Returns the head task without blocking, or `None` if empty.
    pub fn poll(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wakes a blocked [`SaveQueue::take`] and makes later takes return
    /// immediately. Idempotent.
    pub fn interrupt(&self) {
        self.stop_tx.lock().take();
    }

    /// Returns whether [`SaveQueue::interrupt`] has been called.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = SaveQueue::new();
        for i in 0..5 {
            queue.submit(i);
        }
        assert_eq!(queue.len(), 5);
        let taken: Vec<i32> = (0..5)
            .map(|_| match queue.take() {
                Take::Task(t) => t,
                Take::Interrupted => -1,
            })
            .collect();
        assert_eq!(taken, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_poll_empty_returns_none() {
        let queue: SaveQueue<u8> = SaveQueue::new();
        assert!(queue.poll().is_none());
        queue.submit(1);
        assert_eq!(queue.poll(), Some(1));
    }

    #[test]
    fn test_interrupt_wakes_blocked_take() {
        let queue: Arc<SaveQueue<u32>> = Arc::new(SaveQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || matches!(queue.take(), Take::Interrupted))
        };
        thread::sleep(Duration::from_millis(20));
        queue.interrupt();
        assert!(waiter.join().expect("join"));
        assert!(queue.is_interrupted());
    }

    #[test]
    fn test_interrupted_queue_still_accepts_and_polls() {
        let queue = SaveQueue::new();
        queue.interrupt();
        queue.interrupt();
        queue.submit("late");
        assert!(matches!(queue.take(), Take::Interrupted));
        assert_eq!(queue.poll(), Some("late"));
    }
}
