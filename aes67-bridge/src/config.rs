//! Stream configuration: validated once, read-only while networking runs.

use std::net::Ipv4Addr;

use crate::error::BridgeError;

/// Packet durations AES67 permits, in microseconds.
pub const VALID_PACKET_TIMES_US: [u32; 5] = [125, 250, 333, 1000, 4000];

/// Wire sample depths the codec supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Pcm16,
    Pcm24,
    Pcm32,
}

impl BitDepth {
    /// Parse a bit count, rejecting anything the wire format cannot carry.
    pub fn from_bits(bits: u16) -> Result<Self, BridgeError> {
        match bits {
            16 => Ok(Self::Pcm16),
            24 => Ok(Self::Pcm24),
            32 => Ok(Self::Pcm32),
            other => Err(BridgeError::InvalidConfig(format!(
                "unsupported bit depth {other}, must be 16, 24 or 32"
            ))),
        }
    }

    pub fn bits(&self) -> u16 {
        match self {
            Self::Pcm16 => 16,
            Self::Pcm24 => 24,
            Self::Pcm32 => 32,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits()) / 8
    }
}

/// Immutable parameters of one AES67 stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Audio sample rate in Hz; sender and receiver must agree.
    pub sample_rate: u32,
    /// Channel count, 1..=8.
    pub channels: u16,
    /// Wire sample depth.
    pub bit_depth: BitDepth,
    /// Audio duration carried by one packet.
    pub packet_time_us: u32,
    /// RTP payload type, 0..=127.
    pub payload_type: u8,
    /// Multicast group the stream lives on.
    pub group: Ipv4Addr,
    /// UDP port.
    pub port: u16,
    /// IPv4 address of the local interface, or any.
    pub interface: Option<Ipv4Addr>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: BitDepth::Pcm24,
            packet_time_us: 1000,
            payload_type: 96,
            group: Ipv4Addr::new(239, 69, 83, 133),
            port: 5004,
            interface: None,
        }
    }
}

impl StreamConfig {
    /// Check every field; called before networking starts and after any
    /// setter so a bad value never reaches the wire.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.sample_rate == 0 {
            return Err(BridgeError::InvalidConfig(
                "sample rate must be non-zero".into(),
            ));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(BridgeError::InvalidConfig(format!(
                "channel count {} out of range 1..=8",
                self.channels
            )));
        }
        if !VALID_PACKET_TIMES_US.contains(&self.packet_time_us) {
            return Err(BridgeError::InvalidConfig(format!(
                "packet time {}us, must be 125, 250, 333, 1000 or 4000",
                self.packet_time_us
            )));
        }
        if self.payload_type > 127 {
            return Err(BridgeError::InvalidConfig(format!(
                "payload type {} out of range 0..=127",
                self.payload_type
            )));
        }
        if !self.group.is_multicast() {
            return Err(BridgeError::InvalidConfig(format!(
                "{} is not a multicast address",
                self.group
            )));
        }
        if self.samples_per_packet() == 0 {
            return Err(BridgeError::InvalidConfig(
                "packet time too short for the sample rate".into(),
            ));
        }
        Ok(())
    }

    /// Audio frames carried by one packet.
    pub fn samples_per_packet(&self) -> usize {
        (self.packet_time_us as u64 * self.sample_rate as u64 / 1_000_000) as usize
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bit_depth.bytes_per_sample()
    }

    /// Encoded payload size of one packet.
    pub fn payload_bytes(&self) -> usize {
        self.samples_per_packet() * usize::from(self.channels) * self.bytes_per_sample()
    }

    /// Interleaved float samples per packet.
    pub fn floats_per_packet(&self) -> usize {
        self.samples_per_packet() * usize::from(self.channels)
    }
}
