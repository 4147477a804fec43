//! RTP packetisation, session state and the reorder window.

pub mod reorder;
pub mod session;

pub use reorder::ReorderBuffer;
pub use session::{RtpCounters, RtpPacket, RtpSession, RtpStats};
