//! Shared FIFO of interleaved samples between the audio callback and the
//! bridge worker.
//!
//! One mutex, short critical sections: a single append (with truncation) or
//! a single pop per holder. Overflow drops the oldest samples so latency
//! stays bounded; the newest audio always wins.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

pub struct SampleQueue {
    inner: Mutex<VecDeque<f32>>,
    capacity: AtomicUsize,
    overruns: AtomicU64,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity),
            overruns: AtomicU64::new(0),
        }
    }

    /// Replace the capacity. Only sensible while the stream is stopped; any
    /// excess is discarded from the front.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
        let mut queue = self.inner.lock();
        if queue.len() > capacity {
            let excess = queue.len() - capacity;
            queue.drain(..excess);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append interleaved samples, dropping the oldest on overflow.
    pub fn push_slice(&self, samples: &[f32]) {
        let capacity = self.capacity.load(Ordering::SeqCst);
        let mut queue = self.inner.lock();
        queue.extend(samples.iter().copied());
        if queue.len() > capacity {
            let excess = queue.len() - capacity;
            queue.drain(..excess);
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pop exactly `out.len()` samples from the front, or refuse and leave
    /// the queue untouched. The caller zero-fills on refusal.
    pub fn pop_slice(&self, out: &mut [f32]) -> bool {
        let mut queue = self.inner.lock();
        if queue.len() < out.len() {
            return false;
        }
        let len = out.len();
        for (slot, sample) in out.iter_mut().zip(queue.drain(..len)) {
            *slot = sample;
        }
        true
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Fill level relative to capacity, 0.0..=1.0.
    pub fn level(&self) -> f32 {
        let capacity = self.capacity.load(Ordering::SeqCst);
        if capacity == 0 {
            return 0.0;
        }
        self.inner.lock().len() as f32 / capacity as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order() {
        let queue = SampleQueue::new(16);
        queue.push_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = [0.0f32; 4];
        assert!(queue.pop_slice(&mut out));
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn refuses_short_pop() {
        let queue = SampleQueue::new(16);
        queue.push_slice(&[1.0, 2.0]);
        let mut out = [0.0f32; 4];
        assert!(!queue.pop_slice(&mut out));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn overflow_truncates_from_front() {
        let queue = SampleQueue::new(4);
        queue.push_slice(&[1.0, 2.0, 3.0, 4.0]);
        queue.push_slice(&[5.0, 6.0]);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.overruns(), 1);

        let mut out = [0.0f32; 4];
        assert!(queue.pop_slice(&mut out));
        // The two oldest samples were dropped.
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let queue = SampleQueue::new(8);
        for _ in 0..10 {
            queue.push_slice(&[0.0; 5]);
            assert!(queue.len() <= queue.capacity());
        }
    }

    #[test]
    fn set_capacity_discards_oldest() {
        let queue = SampleQueue::new(8);
        queue.push_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        queue.set_capacity(3);
        let mut out = [0.0f32; 3];
        assert!(queue.pop_slice(&mut out));
        assert_eq!(out, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn level_tracks_fill() {
        let queue = SampleQueue::new(10);
        assert_eq!(queue.level(), 0.0);
        queue.push_slice(&[0.0; 5]);
        assert!((queue.level() - 0.5).abs() < f32::EPSILON);
    }
}
