//! Serialized delivery of callbacks.
//!
//! Mutations never run user callbacks directly. They enqueue [`Task`]s which
//! are run later by [`EventQueue::drain`], outside every engine lock, one at
//! a time and in enqueue order.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// A deferred callback invocation.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of pending callback invocations.
#[derive(Default)]
pub struct EventQueue {
    tasks: Mutex<VecDeque<Task>>,
    delivering: Mutex<()>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one task.
    pub fn push(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    /// Appends tasks, keeping their order.
    pub fn extend<I: IntoIterator<Item = Task>>(&self, tasks: I) {
        self.tasks.lock().extend(tasks);
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no task is pending.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Runs pending tasks until the queue is empty.
    ///
    /// Tasks enqueued while draining are run in the same call. If another
    /// drain is already in progress (on another thread, or further up this
    /// thread's stack from inside a callback), returns 0 immediately and
    /// leaves the work to that drain.
    pub fn drain(&self) -> usize {
        let Some(_guard) = self.delivering.try_lock() else {
            return 0;
        };
        let mut ran = 0;
        loop {
            let next = self.tasks.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn runs_in_order() {
        let queue = EventQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            queue.push(Box::new(move || log.lock().push(i)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn reentrant_drain_is_a_no_op() {
        let queue = Arc::new(EventQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = Arc::clone(&queue);
        let inner_log = Arc::clone(&log);
        queue.push(Box::new(move || {
            let log = Arc::clone(&inner_log);
            inner_queue.push(Box::new(move || log.lock().push("second")));
            inner_log.lock().push("first");
            // Nested drain must not run "second" before "first" finishes.
            assert_eq!(inner_queue.drain(), 0);
        }));

        assert_eq!(queue.drain(), 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }
}
