//! Boundary to the host audio engine.
//!
//! The bridge registers one real-time process callback and one sample-rate
//! listener; the engine owns the device threads. The shipped implementation
//! drives cpal with a capture stream feeding a lock-free ring that the
//! playback callback reads, so the process callback observes input and
//! output in a single call.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use tracing::{info, warn};

use crate::error::BridgeError;

/// One block of audio exchanged with the engine, one slice per channel.
pub struct AudioBlock<'a, 'b> {
    pub frames: usize,
    pub inputs: &'a [&'a [f32]],
    pub outputs: &'a mut [&'b mut [f32]],
}

/// Real-time process callback. Runs on the engine's audio thread; it must
/// not allocate or block for unbounded time.
pub type ProcessFn = Box<dyn FnMut(&mut AudioBlock<'_, '_>) + Send + 'static>;

/// Invoked once the engine's sample rate is known (and on changes).
pub type SampleRateFn = Box<dyn FnMut(u32) + Send + 'static>;

/// Capability interface of the host audio engine.
pub trait AudioEngine {
    fn register_callback(&mut self, callback: ProcessFn);
    fn set_sample_rate_listener(&mut self, listener: SampleRateFn);
    fn connect_inputs(&mut self) -> Result<(), BridgeError>;
    fn connect_outputs(&mut self) -> Result<(), BridgeError>;
    fn activate(&mut self) -> Result<(), BridgeError>;
    fn deactivate(&mut self) -> Result<(), BridgeError>;
    fn teardown(&mut self);
}

/// cpal-backed engine. cpal has no duplex streams, so capture lands in a
/// SPSC ring and the playback data callback assembles the duplex block.
pub struct CpalEngine {
    channels: usize,
    sample_rate: u32,
    callback: Option<ProcessFn>,
    rate_listener: Option<SampleRateFn>,
    input_device: Option<cpal::Device>,
    output_device: Option<cpal::Device>,
    input_stream: Option<cpal::Stream>,
    output_stream: Option<cpal::Stream>,
}

impl CpalEngine {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels: usize::from(channels).max(1),
            sample_rate,
            callback: None,
            rate_listener: None,
            input_device: None,
            output_device: None,
            input_stream: None,
            output_stream: None,
        }
    }

    fn stream_config(&self) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: self.channels as cpal::ChannelCount,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

impl AudioEngine for CpalEngine {
    fn register_callback(&mut self, callback: ProcessFn) {
        self.callback = Some(callback);
    }

    fn set_sample_rate_listener(&mut self, listener: SampleRateFn) {
        self.rate_listener = Some(listener);
    }

    fn connect_inputs(&mut self) -> Result<(), BridgeError> {
        self.input_device = cpal::default_host().default_input_device();
        if self.input_device.is_none() {
            // Not fatal: a receive-only box has nothing to capture anyway.
            info!("no capture device available, inputs will be silent");
        }
        Ok(())
    }

    fn connect_outputs(&mut self) -> Result<(), BridgeError> {
        let device = cpal::default_host().default_output_device().ok_or_else(|| {
            BridgeError::AudioEngineFailure("no playback device available".into())
        })?;
        self.output_device = Some(device);
        Ok(())
    }

    fn activate(&mut self) -> Result<(), BridgeError> {
        let mut process = self.callback.take().ok_or_else(|| {
            BridgeError::AudioEngineFailure("no process callback registered".into())
        })?;
        if let Some(listener) = self.rate_listener.as_mut() {
            listener(self.sample_rate);
        }

        let config = self.stream_config();
        let channels = self.channels;

        // Capture-to-playback transfer ring, one second deep.
        let ring = HeapRb::<f32>::new(self.sample_rate as usize * channels);
        let (mut producer, mut consumer) = ring.split();

        if let Some(device) = &self.input_device {
            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let _ = producer.push_slice(data);
                    },
                    |err| warn!("capture stream error: {err}"),
                    None,
                )
                .map_err(|e| BridgeError::AudioEngineFailure(format!("capture stream: {e}")))?;
            stream
                .play()
                .map_err(|e| BridgeError::AudioEngineFailure(format!("capture start: {e}")))?;
            self.input_stream = Some(stream);
        }

        let device = self.output_device.as_ref().ok_or_else(|| {
            BridgeError::AudioEngineFailure("no playback device connected".into())
        })?;

        let mut interleaved: Vec<f32> = Vec::new();
        let mut input_channels: Vec<Vec<f32>> = vec![Vec::new(); channels];
        let mut output_channels: Vec<Vec<f32>> = vec![Vec::new(); channels];

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;

                    interleaved.resize(frames * channels, 0.0);
                    let got = consumer.pop_slice(&mut interleaved);
                    interleaved[got..].fill(0.0);

                    for ch in 0..channels {
                        input_channels[ch].resize(frames, 0.0);
                        output_channels[ch].resize(frames, 0.0);
                        for i in 0..frames {
                            input_channels[ch][i] = interleaved[i * channels + ch];
                        }
                    }

                    {
                        let inputs: Vec<&[f32]> =
                            input_channels.iter().map(|c| c.as_slice()).collect();
                        let mut outputs: Vec<&mut [f32]> =
                            output_channels.iter_mut().map(|c| c.as_mut_slice()).collect();
                        let mut block = AudioBlock {
                            frames,
                            inputs: inputs.as_slice(),
                            outputs: outputs.as_mut_slice(),
                        };
                        process(&mut block);
                    }

                    for ch in 0..channels {
                        for i in 0..frames {
                            data[i * channels + ch] = output_channels[ch][i];
                        }
                    }
                },
                |err| warn!("playback stream error: {err}"),
                None,
            )
            .map_err(|e| BridgeError::AudioEngineFailure(format!("playback stream: {e}")))?;
        stream
            .play()
            .map_err(|e| BridgeError::AudioEngineFailure(format!("playback start: {e}")))?;
        self.output_stream = Some(stream);

        info!(
            rate = self.sample_rate,
            channels = self.channels,
            "audio engine active"
        );
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), BridgeError> {
        if let Some(stream) = &self.output_stream {
            stream
                .pause()
                .map_err(|e| BridgeError::AudioEngineFailure(format!("playback pause: {e}")))?;
        }
        if let Some(stream) = &self.input_stream {
            stream
                .pause()
                .map_err(|e| BridgeError::AudioEngineFailure(format!("capture pause: {e}")))?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        self.input_device = None;
        self.output_device = None;
    }
}
