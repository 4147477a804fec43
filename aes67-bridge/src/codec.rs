//! Sample format conversion between normalised float and packed big-endian
//! PCM, with TPDF dither and first-order noise shaping on the way down.
//!
//! The shaping state is per channel and must survive across calls; resetting
//! it mid-stream produces audible clicks. Changing the channel count is the
//! one event that resets everything.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::BitDepth;
use crate::error::BridgeError;

/// Per-channel noise shaping state.
#[derive(Debug, Default, Clone, Copy)]
struct DitherState {
    error: f32,
    error_prev1: f32,
    error_prev2: f32,
    random: f32,
}

/// Converts between interleaved f32 samples (nominal [-1, +1]) and the wire
/// sample format at 16, 24 or 32 bits.
pub struct SampleCodec {
    bit_depth: BitDepth,
    channels: usize,
    max_value: f32,
    min_value: f32,
    dither_scale: f32,
    bytes_per_sample: usize,
    dither: Vec<DitherState>,
    rng: SmallRng,
}

impl SampleCodec {
    pub fn new(bit_depth: BitDepth, channels: u16) -> Result<Self, BridgeError> {
        if channels == 0 {
            return Err(BridgeError::InvalidConfig(
                "channel count must be at least 1".into(),
            ));
        }
        let (max_value, min_value) = match bit_depth {
            BitDepth::Pcm16 => (32767.0, -32768.0),
            BitDepth::Pcm24 => (8_388_607.0, -8_388_608.0),
            BitDepth::Pcm32 => (2_147_483_647.0, -2_147_483_648.0),
        };
        Ok(Self {
            bit_depth,
            channels: usize::from(channels),
            max_value,
            min_value,
            dither_scale: 4.0 / max_value,
            bytes_per_sample: bit_depth.bytes_per_sample(),
            dither: vec![DitherState::default(); usize::from(channels)],
            rng: SmallRng::from_entropy(),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample
    }

    /// Change the channel count. Resets all shaping state.
    pub fn set_channels(&mut self, channels: u16) {
        self.channels = usize::from(channels).max(1);
        self.dither = vec![DitherState::default(); self.channels];
    }

    /// Encode interleaved floats into packed big-endian PCM. Infallible:
    /// out-of-range samples clamp to full scale.
    pub fn encode(&mut self, input: &[f32], output: &mut Vec<u8>) {
        let frames = input.len() / self.channels;
        output.clear();
        output.resize(frames * self.channels * self.bytes_per_sample, 0);

        for frame in 0..frames {
            for channel in 0..self.channels {
                let index = frame * self.channels + channel;
                let quantized = self.quantize(input[index], channel);
                let offset = index * self.bytes_per_sample;
                match self.bit_depth {
                    BitDepth::Pcm16 => {
                        output[offset] = ((quantized >> 8) & 0xFF) as u8;
                        output[offset + 1] = (quantized & 0xFF) as u8;
                    }
                    BitDepth::Pcm24 => {
                        output[offset] = ((quantized >> 16) & 0xFF) as u8;
                        output[offset + 1] = ((quantized >> 8) & 0xFF) as u8;
                        output[offset + 2] = (quantized & 0xFF) as u8;
                    }
                    BitDepth::Pcm32 => {
                        output[offset..offset + 4].copy_from_slice(&quantized.to_be_bytes());
                    }
                }
            }
        }
    }

    /// One sample through the shaping filter. The +0.5 bias plus truncation
    /// rounds to nearest for non-negative values and toward zero for
    /// negative ones; the wire format is defined around that behaviour.
    fn quantize(&mut self, sample: f32, channel: usize) -> i32 {
        let draw = self.rng.gen_range(-0.5f32..0.5f32) * self.dither_scale;
        let state = &mut self.dither[channel];

        let scaled = sample * self.max_value;
        let shaped = scaled + state.error - state.error_prev1 + state.error_prev2;
        let dithered =
            (shaped + 0.5 + (draw - state.random)).clamp(self.min_value, self.max_value);
        let quantized = dithered as i32;

        state.random = draw;
        state.error_prev2 = state.error_prev1;
        state.error_prev1 = state.error;
        state.error = scaled - quantized as f32;

        quantized
    }

    /// Decode packed big-endian PCM into interleaved floats.
    pub fn decode(&self, input: &[u8], output: &mut Vec<f32>) {
        let samples = input.len() / self.bytes_per_sample;
        output.clear();
        output.reserve(samples);

        for i in 0..samples {
            let src = &input[i * self.bytes_per_sample..];
            let value = match self.bit_depth {
                BitDepth::Pcm16 => i16::from_be_bytes([src[0], src[1]]) as i32,
                BitDepth::Pcm24 => {
                    let mut v = ((src[0] as i32) << 16) | ((src[1] as i32) << 8) | src[2] as i32;
                    if v & 0x0080_0000 != 0 {
                        v |= 0xFF00_0000u32 as i32;
                    }
                    v
                }
                BitDepth::Pcm32 => i32::from_be_bytes([src[0], src[1], src[2], src[3]]),
            };
            output.push((value as f32 / self.max_value).clamp(-1.0, 1.0));
        }
    }
}
