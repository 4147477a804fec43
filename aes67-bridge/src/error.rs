//! Error types for the bridge.

use thiserror::Error;

/// Errors surfaced by the bridge and its components.
///
/// Configuration errors are returned before any state changes. Transient
/// network trouble inside the worker loops is logged and counted, never
/// propagated out of the loop.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A control operation was attempted while networking is active.
    #[error("operation not permitted while networking is active")]
    Busy,

    /// Socket creation, bind, multicast join or connect failed.
    #[error("network initialisation failed: {0}")]
    NetworkInit(String),

    /// A transient send or receive failure.
    #[error("network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),

    /// An incoming packet failed RTP header validation.
    #[error("malformed RTP packet")]
    MalformedPacket,

    /// Audio handed to the packet builder was empty or inconsistent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The PTP slave could not be started.
    #[error("PTP initialisation failed: {0}")]
    PtpInit(#[from] aes67_ptp::PtpError),

    /// The host audio engine failed.
    #[error("audio engine failure: {0}")]
    AudioEngineFailure(String),
}
