//! Sample queue between a polling thread and the audio callback
//!
//! Lock-free and unbounded, but a batch push first checks the backlog and
//! drops it when the consumer has fallen too far behind. A slow or stalled
//! audio callback therefore costs a glitch, never unbounded latency.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// When a batch push discards the backlog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowPolicy {
    /// Desired steady-state depth in samples
    pub target_depth: usize,
    /// Samples the producer's whole ring holds
    pub ring_capacity: usize,
    pub multiplier: usize,
}

impl OverflowPolicy {
    pub fn new(target_depth: usize, ring_capacity: usize, multiplier: usize) -> Self {
        Self {
            target_depth,
            ring_capacity,
            multiplier,
        }
    }

    /// True when `len` exceeds both scaled thresholds
    pub fn should_reset(&self, len: usize) -> bool {
        len > self.multiplier.saturating_mul(self.target_depth)
            && len > self.multiplier.saturating_mul(self.ring_capacity)
    }
}

/// Interleaved f32 samples, one producer thread and one consumer thread
pub struct SampleQueue {
    queue: SegQueue<f32>,
    policy: OverflowPolicy,
    reset_count: AtomicUsize,
    underrun_count: AtomicUsize,
    enqueued: AtomicUsize,
}

impl SampleQueue {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            queue: SegQueue::new(),
            policy,
            reset_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
            enqueued: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn enqueue(&self, sample: f32) -> bool {
        self.queue.push(sample);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pop one sample; never blocks. Counts an underrun when empty.
    pub fn try_dequeue(&self) -> Option<f32> {
        match self.queue.pop() {
            Some(sample) => Some(sample),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Apply the overflow policy, then enqueue `samples`.
    /// Returns true if the backlog was discarded.
    pub fn push_batch(&self, samples: &[f32]) -> bool {
        let reset = self.policy.should_reset(self.len());
        if reset {
            let dropped = self.clear();
            self.reset_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Sample queue overflow, dropped {} samples", dropped);
        }
        for &sample in samples {
            self.queue.push(sample);
        }
        self.enqueued.fetch_add(samples.len(), Ordering::Relaxed);
        reset
    }

    /// Drain everything. Returns the number of samples dropped.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Approximate while the other side is active
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn reset_count(&self) -> usize {
        self.reset_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Total samples ever enqueued
    pub fn enqueued(&self) -> usize {
        self.enqueued.load(Ordering::Relaxed)
    }
}
