//! Stall-driven scheduling of I/O versus compute threads.
//!
//! Compute throughput is bounded by index locality, I/O throughput by the
//! disk; instead of a static split the scheduler trades CPU cores online.
//! The consumer reports how long it just stalled on an empty ready queue
//! and where the queue sits against its watermarks; the scheduler answers
//! with a directive to grow the I/O side, and raises a preempt flag when
//! the ready queue runs hot so the next I/O worker parks its file and
//! returns its core to compute.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use log::debug;

use crate::types::ReadyLevel;

/// Stall penalty that justifies spawning another I/O worker.
pub const STALL_SPAWN: Duration = Duration::from_millis(500);

/// What the consumer should do after a `run_manager` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Spawn one more I/O worker (the scheduler already counted it).
    SpawnIo,
    Steady,
}

pub struct Scheduler {
    io_threads: AtomicUsize,
    max_io: usize,
    io_complete: AtomicBool,
    preempt: AtomicBool,
    end_signal: AtomicBool,
}

impl Scheduler {
    pub fn new(max_io: usize) -> Self {
        Scheduler {
            io_threads: AtomicUsize::new(0),
            max_io: max_io.max(1),
            io_complete: AtomicBool::new(false),
            preempt: AtomicBool::new(false),
            end_signal: AtomicBool::new(false),
        }
    }

    /// Arbitrate once per consumer iteration.
    ///
    /// `penalty` is the wall-clock time the consumer just spent blocked on
    /// an empty ready queue; `level` is the queue's watermark status.
    pub fn run_manager(&self, penalty: Duration, level: ReadyLevel) -> Directive {
        if penalty >= STALL_SPAWN
            && level == ReadyLevel::BelowLow
            && !self.io_complete.load(Ordering::Acquire)
            && self.io_threads.load(Ordering::Acquire) < self.max_io
        {
            self.register_io();
            debug!(
                "stall penalty {:?}: growing I/O side to {}",
                penalty,
                self.active_io()
            );
            return Directive::SpawnIo;
        }

        if level == ReadyLevel::AboveHigh && self.io_threads.load(Ordering::Acquire) > 1 {
            self.preempt.store(true, Ordering::Release);
        }

        Directive::Steady
    }

    /// Count a newly spawned I/O worker.
    pub fn register_io(&self) {
        self.io_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// I/O worker count, which the compute kernel subtracts from its width.
    pub fn active_io(&self) -> usize {
        self.io_threads.load(Ordering::Acquire)
    }

    /// End-of-search signal: all input drained and no I/O worker running.
    pub fn check_signal(&self) -> bool {
        self.end_signal.load(Ordering::Acquire)
    }

    /// Read and clear the preempt request. Only one worker observes each
    /// request.
    pub fn check_preempt(&self) -> bool {
        self.preempt.swap(false, Ordering::AcqRel)
    }

    /// Ack from a worker that parked its file and yielded its slot.
    pub fn yield_slot(&self) {
        self.io_threads.fetch_sub(1, Ordering::AcqRel);
    }

    /// Ack from a worker that found every input drained. The end signal
    /// fires once the last worker leaves.
    pub fn mark_io_complete(&self) {
        self.io_complete.store(true, Ordering::Release);
        if self.io_threads.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.end_signal.store(true, Ordering::Release);
        }
    }

    /// Whether the input side has nothing more to produce.
    pub fn is_io_complete(&self) -> bool {
        self.io_complete.load(Ordering::Acquire)
    }

    /// A file went back to the park queue: input exists again, so spawning
    /// must stay possible even if another worker already saw empty queues.
    pub fn reopen_io(&self) {
        self.io_complete.store(false, Ordering::Release);
    }

    /// Raise the end signal directly (teardown of a search with no input).
    pub fn force_end(&self) {
        self.end_signal.store(true, Ordering::Release);
    }
}
