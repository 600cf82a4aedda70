//! Bounded double-queue buffer pool for spectrum batches.
//!
//! A fixed ring of preallocated batches cycles between two queues: `wait`
//! holds empty buffers for the I/O side, `ready` holds filled batches for
//! the compute side. Ownership of a batch is queue membership itself:
//! batches move by value, so a batch is in exactly one of wait, ready, or
//! in flight at its current holder. Each queue has its own mutex and the
//! two are never held together.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{ReadyLevel, SpectrumBatch};

pub struct BatchPool {
    wait: Mutex<VecDeque<SpectrumBatch>>,
    ready: Mutex<VecDeque<SpectrumBatch>>,
    capacity: usize,
    low: usize,
    high: usize,
}

impl BatchPool {
    /// Create a pool of `capacity` empty batches with watermarks at a
    /// quarter and three quarters of the ring.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let low = (capacity / 4).max(1);
        let high = (capacity * 3 / 4).max(low + 1);

        let mut wait = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            wait.push_back(SpectrumBatch::new());
        }

        BatchPool {
            wait: Mutex::new(wait),
            ready: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            low,
            high,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Dequeue an empty batch for filling (I/O side). `None` when the wait
    /// queue is drained.
    pub fn acquire_empty(&self) -> Option<SpectrumBatch> {
        self.wait.lock().unwrap().pop_front()
    }

    /// Publish a filled batch to the ready queue.
    pub fn publish(&self, batch: SpectrumBatch) {
        self.ready.lock().unwrap().push_back(batch);
    }

    /// Take the oldest filled batch (compute side).
    pub fn take_ready(&self) -> Option<SpectrumBatch> {
        self.ready.lock().unwrap().pop_front()
    }

    /// Return a consumed batch to the wait queue, cleared for reuse.
    pub fn recycle(&self, mut batch: SpectrumBatch) {
        batch.reset();
        self.wait.lock().unwrap().push_back(batch);
    }

    pub fn is_ready_empty(&self) -> bool {
        self.ready.lock().unwrap().is_empty()
    }

    pub fn is_wait_empty(&self) -> bool {
        self.wait.lock().unwrap().is_empty()
    }

    /// Ready-queue depth against the low/high watermarks.
    pub fn ready_level(&self) -> ReadyLevel {
        let depth = self.ready.lock().unwrap().len();
        if depth < self.low {
            ReadyLevel::BelowLow
        } else if depth > self.high {
            ReadyLevel::AboveHigh
        } else {
            ReadyLevel::Between
        }
    }

    /// Drain both queues on shutdown; returns how many batches came home.
    pub fn drain(&self) -> usize {
        let mut reclaimed = 0;
        loop {
            let mut took = false;
            if self.wait.lock().unwrap().pop_front().is_some() {
                reclaimed += 1;
                took = true;
            }
            if self.ready.lock().unwrap().pop_front().is_some() {
                reclaimed += 1;
                took = true;
            }
            if !took {
                return reclaimed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_starts_all_waiting() {
        let pool = BatchPool::new(4);
        assert!(pool.is_ready_empty());
        assert!(!pool.is_wait_empty());
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_batch_lifecycle() {
        let pool = BatchPool::new(2);

        let mut batch = pool.acquire_empty().unwrap();
        batch.push_spectrum(1000.0, 2, 0.0, &[(100, 1.0)]);
        batch.batch = 7;
        pool.publish(batch);

        assert!(!pool.is_ready_empty());
        let batch = pool.take_ready().unwrap();
        assert_eq!(batch.batch, 7);
        assert_eq!(batch.count, 1);

        pool.recycle(batch);
        // Recycled batches come back clean.
        let batch = pool.acquire_empty().unwrap();
        let batch2 = pool.acquire_empty().unwrap();
        assert_eq!(batch.count, 0);
        assert_eq!(batch2.count, 0);
        assert!(pool.acquire_empty().is_none());
    }

    #[test]
    fn test_wait_exhaustion() {
        let pool = BatchPool::new(2);
        let a = pool.acquire_empty().unwrap();
        let b = pool.acquire_empty().unwrap();
        assert!(pool.is_wait_empty());
        assert!(pool.acquire_empty().is_none());
        pool.recycle(a);
        pool.recycle(b);
        assert!(!pool.is_wait_empty());
    }

    #[test]
    fn test_ready_level_watermarks() {
        let pool = BatchPool::new(20); // low 5, high 15
        assert_eq!(pool.ready_level(), ReadyLevel::BelowLow);

        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(pool.acquire_empty().unwrap());
        }
        for (i, batch) in held.into_iter().enumerate() {
            pool.publish(batch);
            let level = pool.ready_level();
            let depth = i + 1;
            if depth < 5 {
                assert_eq!(level, ReadyLevel::BelowLow, "depth {}", depth);
            } else if depth > 15 {
                assert_eq!(level, ReadyLevel::AboveHigh, "depth {}", depth);
            } else {
                assert_eq!(level, ReadyLevel::Between, "depth {}", depth);
            }
        }
    }

    #[test]
    fn test_drain_recovers_everything() {
        let pool = BatchPool::new(3);
        let batch = pool.acquire_empty().unwrap();
        pool.publish(batch);
        assert_eq!(pool.drain(), 3);
        assert!(pool.is_ready_empty());
        assert!(pool.is_wait_empty());
    }
}
