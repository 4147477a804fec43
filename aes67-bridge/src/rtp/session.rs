//! RTP session state: packet building, parsing and stream counters.
//!
//! The AES67 profile keeps the header fixed at 12 bytes: no CSRCs, no
//! extensions, no padding, marker always clear. Payload is packed big-endian
//! PCM, channel-interleaved within each frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::error::BridgeError;

/// Fixed RTP header length for this profile.
pub const RTP_HEADER_LEN: usize = 12;

/// Monotonic stream counters, shared with diagnostic readers. Each field is
/// written by a single thread; anyone may read.
#[derive(Debug, Default)]
pub struct RtpCounters {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub out_of_order: AtomicU64,
}

/// Plain snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub out_of_order: u64,
}

impl RtpCounters {
    pub fn snapshot(&self) -> RtpStats {
        RtpStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
        }
    }
}

/// A parsed incoming packet. The payload stays borrowed from the receive
/// buffer; decoding to float is the codec's job.
#[derive(Debug)]
pub struct RtpPacket<'a> {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_type: u8,
    /// Audio frames in the payload at the session's channel count and depth.
    pub frames: usize,
    pub payload: &'a [u8],
}

/// One direction of an RTP stream: outgoing wire state plus the parser for
/// incoming packets.
pub struct RtpSession {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    payload_type: u8,
    channels: usize,
    bytes_per_sample: usize,
    counters: Arc<RtpCounters>,
}

impl RtpSession {
    /// Create a session with a fresh random SSRC.
    pub fn new(
        payload_type: u8,
        channels: u16,
        bytes_per_sample: usize,
        counters: Arc<RtpCounters>,
    ) -> Self {
        let ssrc = rand::thread_rng().gen_range(1..=u32::MAX);
        Self::with_ssrc(ssrc, payload_type, channels, bytes_per_sample, counters)
    }

    /// Create a session with a caller-chosen SSRC.
    pub fn with_ssrc(
        ssrc: u32,
        payload_type: u8,
        channels: u16,
        bytes_per_sample: usize,
        counters: Arc<RtpCounters>,
    ) -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            ssrc,
            payload_type,
            channels: usize::from(channels).max(1),
            bytes_per_sample,
            counters,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn counters(&self) -> &Arc<RtpCounters> {
        &self.counters
    }

    /// Build an outgoing packet around an already-encoded payload, then
    /// advance the wire state for the next one.
    pub fn build_packet(&mut self, payload: &[u8], frames: u32) -> Result<Vec<u8>, BridgeError> {
        if payload.is_empty() || frames == 0 {
            return Err(BridgeError::InvalidInput(
                "audio payload is empty".into(),
            ));
        }
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        packet.push(0x80); // V=2, P=0, X=0, CC=0
        packet.push(self.payload_type & 0x7F); // M=0
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(frames);
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(packet)
    }

    /// Parse an incoming packet, yielding header fields and the payload
    /// slice. Only the version bits are checked; everything else in the
    /// first byte is pinned to zero by the profile.
    pub fn parse_packet<'a>(&self, data: &'a [u8]) -> Result<RtpPacket<'a>, BridgeError> {
        if data.len() < RTP_HEADER_LEN || (data[0] & 0xC0) != 0x80 {
            return Err(BridgeError::MalformedPacket);
        }
        let payload = &data[RTP_HEADER_LEN..];
        let bytes_per_frame = self.channels * self.bytes_per_sample;
        let packet = RtpPacket {
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload_type: data[1] & 0x7F,
            frames: payload.len() / bytes_per_frame,
            payload,
        };
        self.counters
            .packets_received
            .fetch_add(1, Ordering::Relaxed);
        Ok(packet)
    }

    #[cfg(test)]
    pub(crate) fn seed_wire_state(&mut self, sequence: u16, timestamp: u32) {
        self.sequence = sequence;
        self.timestamp = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(ssrc: u32) -> RtpSession {
        RtpSession::with_ssrc(ssrc, 96, 2, 3, Arc::new(RtpCounters::default()))
    }

    #[test]
    fn build_then_parse_round_trips() {
        let mut tx = session(0xDEAD_BEEF);
        tx.seed_wire_state(42, 1000);
        let payload: Vec<u8> = (0..48u8).collect(); // 8 stereo L24 frames
        let packet = tx.build_packet(&payload, 8).unwrap();
        assert_eq!(packet.len(), 12 + 48);

        let rx = session(0);
        let parsed = rx.parse_packet(&packet).unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.timestamp, 1000);
        assert_eq!(parsed.ssrc, 0xDEAD_BEEF);
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.frames, 8);
        assert_eq!(parsed.payload, &payload[..]);
    }

    #[test]
    fn wire_state_advances_per_packet() {
        let mut tx = session(1);
        let payload = vec![0u8; 48 * 2 * 3];
        for i in 0..10u32 {
            assert_eq!(tx.sequence(), i as u16);
            assert_eq!(tx.timestamp(), i * 48);
            tx.build_packet(&payload, 48).unwrap();
        }
        assert_eq!(tx.counters().snapshot().packets_sent, 10);
    }

    #[test]
    fn sequence_and_timestamp_wrap() {
        let mut tx = session(1);
        tx.seed_wire_state(65_535, u32::MAX - 24);
        let payload = vec![0u8; 6];
        let packet = tx.build_packet(&payload, 48).unwrap();
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 65_535);
        assert_eq!(tx.sequence(), 0);
        // u32::MAX - 24 + 48 wraps to 23.
        assert_eq!(tx.timestamp(), 23);
    }

    #[test]
    fn empty_audio_is_rejected() {
        let mut tx = session(1);
        assert!(matches!(
            tx.build_packet(&[], 48),
            Err(BridgeError::InvalidInput(_))
        ));
        assert!(matches!(
            tx.build_packet(&[0, 0, 0], 0),
            Err(BridgeError::InvalidInput(_))
        ));
        assert_eq!(tx.counters().snapshot().packets_sent, 0);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let rx = session(1);
        // Too short.
        assert!(matches!(
            rx.parse_packet(&[0x80u8; 11]),
            Err(BridgeError::MalformedPacket)
        ));
        // Wrong version bits.
        let mut packet = vec![0u8; 24];
        packet[0] = 0x40;
        assert!(matches!(
            rx.parse_packet(&packet),
            Err(BridgeError::MalformedPacket)
        ));
        assert_eq!(rx.counters().snapshot().packets_received, 0);
    }
}
