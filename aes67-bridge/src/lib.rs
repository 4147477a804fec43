//! Bidirectional AES67 audio-over-IP bridge.
//!
//! Moves interleaved linear-PCM audio between a local real-time audio engine
//! and an AES67 multicast domain. The pieces: RTP packetisation with a
//! sequence-indexed reorder window, a PTPv2 slave clock (the `aes67-ptp`
//! crate), sample-format conversion with noise-shaped dither, and a
//! mutex-guarded sample queue coupling the audio callback to the network
//! worker thread.

pub mod audio;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod queue;
pub mod rtp;

pub use bridge::{Aes67Bridge, BridgeMode};
pub use config::{BitDepth, StreamConfig};
pub use error::BridgeError;
