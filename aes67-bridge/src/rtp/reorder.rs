//! Sequence-indexed reorder buffer.
//!
//! Absorbs network jitter and restores RTP sequence order before samples
//! reach the audio path. The buffer deliberately stalls on a gap; the
//! receive worker calls [`ReorderBuffer::skip_gap`] once the socket has gone
//! quiet with packets still pending, trading the missing audio for bounded
//! latency.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::session::RtpCounters;

/// Number of packet slots; a packet lands at `sequence % SLOT_COUNT`.
pub const SLOT_COUNT: usize = 32;
/// Sequence skew beyond which the stream is resynchronised rather than
/// reordered.
const RESYNC_THRESHOLD: i16 = (SLOT_COUNT / 2) as i16;

struct Slot {
    sequence: u16,
    payload: Vec<u8>,
}

/// Fixed window of out-of-order packets, drained in sequence order.
///
/// Owned by the receive worker; only the counters are shared.
pub struct ReorderBuffer {
    slots: [Option<Slot>; SLOT_COUNT],
    expected: u16,
    synced: bool,
    counters: Arc<RtpCounters>,
}

impl ReorderBuffer {
    pub fn new(counters: Arc<RtpCounters>) -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            expected: 0,
            synced: false,
            counters,
        }
    }

    /// Next sequence number the drain is waiting for.
    pub fn expected(&self) -> u16 {
        self.expected
    }

    /// Number of packets currently buffered.
    pub fn buffered(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Insert a received packet according to its sequence number.
    ///
    /// The signed 16-bit difference against the watermark decides the fate:
    /// far behind is stale and dropped, far ahead resynchronises the whole
    /// window, anything within half the window is stored for ordered drain.
    pub fn push(&mut self, sequence: u16, payload: &[u8]) {
        if !self.synced {
            self.expected = sequence;
            self.synced = true;
        }

        let delta = sequence.wrapping_sub(self.expected) as i16;
        if delta < -RESYNC_THRESHOLD {
            // Playout is already past this packet.
            self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if delta > RESYNC_THRESHOLD {
            // Lost continuity; restart the window at the new position.
            self.clear_slots();
            self.expected = sequence;
            self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
        } else if delta > 0 {
            self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
        }

        let index = usize::from(sequence) % SLOT_COUNT;
        if let Some(existing) = &self.slots[index] {
            if existing.sequence != sequence {
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.slots[index] = Some(Slot {
            sequence,
            payload: payload.to_vec(),
        });
    }

    /// Remove and return the payload at the watermark, if it has arrived.
    /// Call repeatedly after a push to drain every contiguous packet.
    pub fn pop_ready(&mut self) -> Option<Vec<u8>> {
        if !self.synced {
            return None;
        }
        let index = usize::from(self.expected) % SLOT_COUNT;
        match &self.slots[index] {
            Some(slot) if slot.sequence == self.expected => {
                let slot = self.slots[index].take();
                self.expected = self.expected.wrapping_add(1);
                slot.map(|s| s.payload)
            }
            _ => None,
        }
    }

    /// Jump the watermark over a gap to the oldest buffered packet, counting
    /// each skipped sequence number as dropped. Returns true if it moved.
    pub fn skip_gap(&mut self) -> bool {
        if !self.synced {
            return false;
        }
        let mut nearest: Option<i16> = None;
        for slot in self.slots.iter().flatten() {
            let delta = slot.sequence.wrapping_sub(self.expected) as i16;
            if delta > 0 && nearest.map_or(true, |n| delta < n) {
                nearest = Some(delta);
            }
        }
        match nearest {
            Some(gap) => {
                self.counters
                    .packets_dropped
                    .fetch_add(gap as u64, Ordering::Relaxed);
                self.expected = self.expected.wrapping_add(gap as u16);
                true
            }
            None => false,
        }
    }

    /// Forget everything; the next packet re-primes the watermark. Used when
    /// the stream's SSRC changes.
    pub fn reset(&mut self) {
        self.clear_slots();
        self.synced = false;
    }

    fn clear_slots(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn prime(&mut self, expected: u16) {
        self.expected = expected;
        self.synced = true;
    }

    #[cfg(test)]
    pub(crate) fn slot_sequence(&self, index: usize) -> Option<u16> {
        self.slots[index].as_ref().map(|slot| slot.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> (ReorderBuffer, Arc<RtpCounters>) {
        let counters = Arc::new(RtpCounters::default());
        (ReorderBuffer::new(counters.clone()), counters)
    }

    fn drain(buffer: &mut ReorderBuffer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(payload) = buffer.pop_ready() {
            out.push(payload);
        }
        out
    }

    #[test]
    fn reorders_swapped_packets() {
        let (mut buf, counters) = buffer();
        buf.prime(10);

        let mut delivered = Vec::new();
        for seq in [10u16, 11, 13, 12] {
            buf.push(seq, &[seq as u8]);
            delivered.extend(drain(&mut buf));
        }

        assert_eq!(delivered, vec![vec![10], vec![11], vec![12], vec![13]]);
        assert_eq!(counters.snapshot().out_of_order, 1);
        assert_eq!(counters.snapshot().packets_dropped, 0);
        assert_eq!(buf.expected(), 14);
    }

    #[test]
    fn stale_packet_is_dropped() {
        let (mut buf, counters) = buffer();
        buf.prime(100);
        buf.push(60, &[1, 2, 3]);
        assert_eq!(counters.snapshot().packets_dropped, 1);
        assert_eq!(buf.buffered(), 0);
        assert_eq!(buf.expected(), 100);
    }

    #[test]
    fn large_forward_jump_resynchronises() {
        let (mut buf, counters) = buffer();
        buf.prime(100);
        buf.push(101, &[1]);
        buf.push(200, &[2]);

        assert_eq!(counters.snapshot().packets_dropped, 1);
        assert_eq!(buf.expected(), 200);
        assert_eq!(buf.buffered(), 1);
        assert_eq!(buf.slot_sequence(200 % SLOT_COUNT), Some(200));
        assert_eq!(drain(&mut buf), vec![vec![2]]);
    }

    #[test]
    fn sequence_wrap_is_contiguous() {
        let (mut buf, counters) = buffer();
        buf.prime(65_535);
        buf.push(65_535, &[1]);
        buf.push(0, &[2]);
        assert_eq!(drain(&mut buf), vec![vec![1], vec![2]]);
        assert_eq!(counters.snapshot().packets_dropped, 0);
        assert_eq!(counters.snapshot().out_of_order, 0);
        assert_eq!(buf.expected(), 1);
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let (mut buf, counters) = buffer();
        buf.prime(5);
        buf.push(5, &[42]);
        let first = drain(&mut buf);
        buf.push(5, &[42]);
        let second = drain(&mut buf);

        assert_eq!(first, vec![vec![42]]);
        assert!(second.is_empty());
        assert_eq!(counters.snapshot().packets_dropped, 0);
    }

    #[test]
    fn stall_then_skip_gap() {
        let (mut buf, counters) = buffer();
        buf.prime(0);
        buf.push(0, &[0]);
        assert_eq!(drain(&mut buf).len(), 1);

        // 1 and 2 never arrive.
        buf.push(3, &[3]);
        buf.push(4, &[4]);
        assert!(drain(&mut buf).is_empty());

        assert!(buf.skip_gap());
        assert_eq!(drain(&mut buf), vec![vec![3], vec![4]]);
        assert_eq!(counters.snapshot().packets_dropped, 2);
        assert!(!buf.skip_gap());
    }

    #[test]
    fn overwrite_of_different_sequence_counts_drop() {
        let (mut buf, counters) = buffer();
        buf.prime(5);
        buf.push(5, &[42]);
        assert_eq!(drain(&mut buf).len(), 1);

        // A late duplicate of 5 parks in slot 5 and never drains.
        buf.push(5, &[42]);
        assert_eq!(counters.snapshot().packets_dropped, 0);

        // One window later, 37 claims the same slot and evicts it.
        for seq in 6u16..37 {
            buf.push(seq, &[seq as u8]);
            drain(&mut buf);
        }
        buf.push(37, &[37]);
        assert_eq!(counters.snapshot().packets_dropped, 1);
        assert_eq!(drain(&mut buf), vec![vec![37]]);
    }

    #[test]
    fn reset_forgets_state() {
        let (mut buf, _) = buffer();
        buf.prime(7);
        buf.push(7, &[7]);
        buf.reset();
        assert_eq!(buf.buffered(), 0);
        // First packet after reset re-primes the watermark.
        buf.push(500, &[5]);
        assert_eq!(buf.expected(), 500);
        assert_eq!(drain(&mut buf), vec![vec![5]]);
    }
}
