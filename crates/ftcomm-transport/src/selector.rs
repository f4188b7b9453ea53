//! Round-robin worker selection with a per-worker link cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::worker::Worker;

/// Picks the worker that will own a new link.
#[derive(Debug)]
pub struct WorkerSelector {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
    capacity: usize,
}

impl WorkerSelector {
    pub fn new(workers: Vec<Arc<Worker>>, capacity: usize) -> Self {
        Self {
            workers,
            next: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves a slot on the next worker with room, starting from the cursor.
    ///
    /// Returns `None` when every worker is at capacity. The caller owns the
    /// reservation and must hand it to [`Worker::add_link`] or give it back
    /// with [`WorkerSelector::release`].
    pub fn select(&self) -> Option<Arc<Worker>> {
        let count = self.workers.len();
        if count == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let worker = &self.workers[(start + offset) % count];
            if worker.try_reserve(self.capacity) {
                return Some(worker.clone());
            }
        }
        tracing::warn!(workers = count, capacity = self.capacity, "all workers saturated");
        None
    }

    pub fn release(&self, worker: &Worker) {
        worker.release_slot();
    }

    pub fn total_bound(&self) -> usize {
        self.workers.iter().map(|w| w.bound()).sum()
    }
}
