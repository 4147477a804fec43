//! PTPv2 wire format.
//!
//! Only the subset an AES67 slave needs: Sync, Follow_Up and Delay_Resp are
//! parsed, Delay_Req is built. Everything else is recognised by type and
//! ignored. All wire integers are big-endian; conversion happens here and
//! nowhere else.

use std::fmt;

/// Common PTP header length in bytes.
pub const HEADER_LEN: usize = 34;
/// Wire length of a timestamp field (48-bit seconds + 32-bit nanoseconds).
pub const TIMESTAMP_LEN: usize = 10;

/// PTP message types (low nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    FollowUp = 0x8,
    DelayResp = 0x9,
    Other = 0xF,
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Sync,
            0x1 => Self::DelayReq,
            0x8 => Self::FollowUp,
            0x9 => Self::DelayResp,
            _ => Self::Other,
        }
    }
}

/// Clock identity (EUI-64 format, 8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        if bytes.len() >= 8 {
            id.copy_from_slice(&bytes[..8]);
        }
        Self(id)
    }
}

impl fmt::Display for ClockIdentity {
    /// Renders as dash-separated uppercase hex, e.g. `00-1D-C1-FF-FE-42-7A-3B`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "-")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Port identity: clock identity plus a port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl PortIdentity {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 10 {
            return None;
        }
        Some(Self {
            clock_identity: ClockIdentity::from_bytes(&bytes[0..8]),
            port_number: u16::from_be_bytes([bytes[8], bytes[9]]),
        })
    }
}

/// PTP timestamp: 48-bit seconds plus 32-bit nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TIMESTAMP_LEN {
            return None;
        }
        let seconds = u64::from_be_bytes([
            0, 0, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
        ]);
        let nanoseconds = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Some(Self {
            seconds,
            nanoseconds,
        })
    }

    /// Convert to a sample count at the given audio rate. The audio domain
    /// is the ruler here; offsets downstream are differences of these.
    pub fn to_samples(&self, sample_rate: u32) -> i64 {
        let rate = sample_rate as u64;
        (self.seconds * rate + (self.nanoseconds as u64 * rate) / 1_000_000_000) as i64
    }
}

/// Common PTP header.
#[derive(Debug, Clone)]
pub struct PtpHeader {
    pub message_type: MessageType,
    pub version: u8,
    pub message_length: u16,
    pub domain: u8,
    pub flags: u16,
    pub source_port: PortIdentity,
    pub sequence_id: u16,
}

impl PtpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            message_type: MessageType::from(data[0]),
            version: data[1] & 0x0F,
            message_length: u16::from_be_bytes([data[2], data[3]]),
            domain: data[4],
            flags: u16::from_be_bytes([data[6], data[7]]),
            source_port: PortIdentity::from_bytes(&data[20..30])?,
            sequence_id: u16::from_be_bytes([data[30], data[31]]),
        })
    }

    /// True for a two-step clock: the precise origin timestamp arrives in a
    /// separate Follow_Up instead of the Sync itself.
    pub fn is_two_step(&self) -> bool {
        (self.flags & 0x0200) != 0
    }
}

/// Extract the timestamp immediately following the common header. Works for
/// Sync origin, Follow_Up precise origin and Delay_Resp receive timestamps,
/// which all sit at the same offset.
pub fn body_timestamp(data: &[u8]) -> Option<PtpTimestamp> {
    if data.len() < HEADER_LEN + TIMESTAMP_LEN {
        return None;
    }
    PtpTimestamp::from_bytes(&data[HEADER_LEN..HEADER_LEN + TIMESTAMP_LEN])
}

/// Delay_Req message. Header plus a zeroed origin timestamp; the send time
/// is captured locally, never written to the wire.
#[derive(Debug, Clone)]
pub struct DelayReq {
    pub source_port: PortIdentity,
    pub domain: u8,
    pub sequence_id: u16,
}

impl DelayReq {
    /// Total wire size: 34-byte header + 10-byte origin timestamp.
    pub const WIRE_LEN: usize = HEADER_LEN + TIMESTAMP_LEN;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::WIRE_LEN];
        buf[0] = MessageType::DelayReq as u8;
        buf[1] = 2; // versionPTP
        buf[2..4].copy_from_slice(&(Self::WIRE_LEN as u16).to_be_bytes());
        buf[4] = self.domain;
        buf[20..28].copy_from_slice(&self.source_port.clock_identity.0);
        buf[28..30].copy_from_slice(&self.source_port.port_number.to_be_bytes());
        buf[30..32].copy_from_slice(&self.sequence_id.to_be_bytes());
        buf[32] = 0x01; // control field: Delay_Req
        buf[33] = 0x7F; // logMessageInterval: not periodic
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_packet(sequence: u16, two_step: bool, seconds: u64, nanoseconds: u32) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + TIMESTAMP_LEN];
        buf[0] = 0x00; // Sync
        buf[1] = 0x02;
        buf[2..4].copy_from_slice(&44u16.to_be_bytes());
        buf[4] = 0; // domain
        if two_step {
            buf[6..8].copy_from_slice(&0x0200u16.to_be_bytes());
        }
        buf[20..28].copy_from_slice(&[0x00, 0x1D, 0xC1, 0xFF, 0xFE, 0x42, 0x7A, 0x3B]);
        buf[28..30].copy_from_slice(&1u16.to_be_bytes());
        buf[30..32].copy_from_slice(&sequence.to_be_bytes());
        buf[34..40].copy_from_slice(&seconds.to_be_bytes()[2..8]);
        buf[40..44].copy_from_slice(&nanoseconds.to_be_bytes());
        buf
    }

    #[test]
    fn parses_sync_header() {
        let data = sync_packet(7, true, 1, 0);
        let header = PtpHeader::parse(&data).unwrap();
        assert_eq!(header.message_type, MessageType::Sync);
        assert_eq!(header.version, 2);
        assert_eq!(header.domain, 0);
        assert_eq!(header.sequence_id, 7);
        assert!(header.is_two_step());
    }

    #[test]
    fn one_step_flag_clear() {
        let data = sync_packet(3, false, 1, 0);
        let header = PtpHeader::parse(&data).unwrap();
        assert!(!header.is_two_step());
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(PtpHeader::parse(&[0u8; 20]).is_none());
    }

    #[test]
    fn timestamp_to_samples() {
        let ts = PtpTimestamp {
            seconds: 1,
            nanoseconds: 500_000_000,
        };
        assert_eq!(ts.to_samples(48_000), 48_000 + 24_000);

        let data = sync_packet(0, false, 2, 250_000_000);
        let parsed = body_timestamp(&data).unwrap();
        assert_eq!(parsed.seconds, 2);
        assert_eq!(parsed.nanoseconds, 250_000_000);
        assert_eq!(parsed.to_samples(48_000), 96_000 + 12_000);
    }

    #[test]
    fn clock_identity_display() {
        let id = ClockIdentity([0x00, 0x1D, 0xC1, 0xFF, 0xFE, 0x42, 0x7A, 0x3B]);
        assert_eq!(id.to_string(), "00-1D-C1-FF-FE-42-7A-3B");
    }

    #[test]
    fn delay_req_round_trip() {
        let req = DelayReq {
            source_port: PortIdentity {
                clock_identity: ClockIdentity([1, 2, 3, 4, 5, 6, 7, 8]),
                port_number: 1,
            },
            domain: 0,
            sequence_id: 42,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), 44);

        let header = PtpHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_type, MessageType::DelayReq);
        assert_eq!(header.version, 2);
        assert_eq!(header.message_length, 44);
        assert_eq!(header.sequence_id, 42);
        assert_eq!(
            header.source_port.clock_identity,
            ClockIdentity([1, 2, 3, 4, 5, 6, 7, 8])
        );
    }
}
