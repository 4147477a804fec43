//! PTPv2 (IEEE 1588-2008) slave for AES67 audio streams.
//!
//! Recovers the grandmaster offset from Sync / Follow_Up / Delay_Resp
//! exchanges and publishes it in audio samples, the unit the downstream
//! stream engine reasons in. Two reader threads listen on the event and
//! general multicast endpoints; everything observable is published through
//! atomics so readers never block the protocol.

pub mod client;
pub mod messages;
pub mod stats;

use std::io;

use thiserror::Error;

pub use client::{PtpConfig, PtpSlave, PTP_EVENT_PORT, PTP_GENERAL_PORT, PTP_PRIMARY_GROUP};
pub use messages::ClockIdentity;
pub use stats::PtpStatus;

/// Errors raised while bringing the slave up. Once running, socket trouble
/// is logged and retried rather than surfaced.
#[derive(Debug, Error)]
pub enum PtpError {
    #[error("failed to bind PTP socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to join PTP multicast group: {0}")]
    MulticastJoin(io::Error),
    #[error("PTP socket setup failed: {0}")]
    Socket(io::Error),
}
