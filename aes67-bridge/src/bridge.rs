//! The bridge: owns the stream configuration, the shared sample queue and
//! the network worker, and feeds the real-time audio callback.
//!
//! The callback and the worker only ever meet at the queue mutex; the worker
//! holds its network sockets exclusively and the PTP slave runs its own
//! threads. Shutdown is a flag flip followed by a bounded join.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use aes67_ptp::{PtpConfig, PtpSlave, PtpStatus};

use crate::audio::{AudioBlock, ProcessFn, SampleRateFn};
use crate::codec::SampleCodec;
use crate::config::{BitDepth, StreamConfig};
use crate::error::BridgeError;
use crate::net::NetworkManager;
use crate::queue::SampleQueue;
use crate::rtp::reorder::ReorderBuffer;
use crate::rtp::session::{RtpCounters, RtpSession, RtpStats};

/// Queue headroom between the callback and the worker, in packets.
const QUEUE_PACKETS: usize = 20;
/// Poll interval for the transmit worker while the queue is short.
const TX_POLL: Duration = Duration::from_millis(1);

/// Direction of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeMode {
    Inactive = 0,
    Transmit = 1,
    Receive = 2,
}

impl BridgeMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Transmit,
            2 => Self::Receive,
            _ => Self::Inactive,
        }
    }
}

/// State shared between the control surface, the audio callback and the
/// worker thread.
pub(crate) struct BridgeShared {
    config: Mutex<StreamConfig>,
    mode: AtomicU8,
    /// Worker cancellation flag.
    running: AtomicBool,
    network_active: AtomicBool,
    queue: SampleQueue,
    counters: Arc<RtpCounters>,
    /// Queue fill level as f32 bits, for lock-free probes.
    buffer_level: AtomicU32,
}

impl BridgeShared {
    fn mode(&self) -> BridgeMode {
        BridgeMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    fn set_buffer_level(&self, level: f32) {
        self.buffer_level.store(level.to_bits(), Ordering::Relaxed);
    }

    fn buffer_level(&self) -> f32 {
        f32::from_bits(self.buffer_level.load(Ordering::Relaxed))
    }
}

/// Bidirectional AES67 bridge between an audio engine and a multicast group.
pub struct Aes67Bridge {
    shared: Arc<BridgeShared>,
    worker: Option<JoinHandle<()>>,
    ptp: Option<PtpSlave>,
}

impl Aes67Bridge {
    pub fn new(config: StreamConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let capacity = QUEUE_PACKETS * config.floats_per_packet();
        let shared = Arc::new(BridgeShared {
            config: Mutex::new(config),
            mode: AtomicU8::new(BridgeMode::Inactive as u8),
            running: AtomicBool::new(false),
            network_active: AtomicBool::new(false),
            queue: SampleQueue::new(capacity),
            counters: Arc::new(RtpCounters::default()),
            buffer_level: AtomicU32::new(0),
        });
        Ok(Self {
            shared,
            worker: None,
            ptp: None,
        })
    }

    fn ensure_idle(&self) -> Result<(), BridgeError> {
        if self.shared.network_active.load(Ordering::SeqCst) {
            Err(BridgeError::Busy)
        } else {
            Ok(())
        }
    }

    pub fn set_mode(&self, mode: BridgeMode) -> Result<(), BridgeError> {
        self.ensure_idle()?;
        self.shared.mode.store(mode as u8, Ordering::SeqCst);
        info!(?mode, "bridge mode set");
        Ok(())
    }

    pub fn set_bit_depth(&self, bits: u16) -> Result<(), BridgeError> {
        self.ensure_idle()?;
        let depth = BitDepth::from_bits(bits)?;
        self.shared.config.lock().bit_depth = depth;
        Ok(())
    }

    pub fn set_packet_time(&self, microseconds: u32) -> Result<(), BridgeError> {
        self.ensure_idle()?;
        let mut config = self.shared.config.lock();
        let mut candidate = config.clone();
        candidate.packet_time_us = microseconds;
        candidate.validate()?;
        *config = candidate;
        drop(config);
        self.resize_queue();
        Ok(())
    }

    pub fn set_network_address(&self, group: Ipv4Addr, port: u16) -> Result<(), BridgeError> {
        self.ensure_idle()?;
        if !group.is_multicast() {
            return Err(BridgeError::InvalidConfig(format!(
                "{group} is not a multicast address"
            )));
        }
        let mut config = self.shared.config.lock();
        config.group = group;
        config.port = port;
        Ok(())
    }

    pub fn set_network_interface(&self, interface: Ipv4Addr) -> Result<(), BridgeError> {
        self.ensure_idle()?;
        self.shared.config.lock().interface = Some(interface);
        Ok(())
    }

    fn resize_queue(&self) {
        let config = self.shared.config.lock();
        self.shared
            .queue
            .set_capacity(QUEUE_PACKETS * config.floats_per_packet());
    }

    /// Real-time process callback to register with the audio engine.
    pub fn process_fn(&self) -> ProcessFn {
        let shared = self.shared.clone();
        let mut scratch: Vec<f32> = Vec::with_capacity(8192);
        Box::new(move |block: &mut AudioBlock<'_, '_>| {
            process_block(&shared, block, &mut scratch);
        })
    }

    /// Listener to hand to `AudioEngine::set_sample_rate_listener`.
    pub fn sample_rate_listener(&self) -> SampleRateFn {
        let shared = self.shared.clone();
        Box::new(move |rate| {
            if rate == 0 {
                return;
            }
            if shared.network_active.load(Ordering::SeqCst) {
                warn!("ignoring sample rate change while networking is active");
                return;
            }
            let capacity = {
                let mut config = shared.config.lock();
                config.sample_rate = rate;
                QUEUE_PACKETS * config.floats_per_packet()
            };
            shared.queue.set_capacity(capacity);
            info!(rate, "sample rate set by audio engine");
        })
    }

    /// Bring up PTP, the sockets and the worker, in that order. Any failure
    /// rolls back what already started.
    pub fn start_networking(&mut self) -> Result<(), BridgeError> {
        if self.shared.network_active.load(Ordering::SeqCst) {
            return Err(BridgeError::Busy);
        }
        let mode = self.shared.mode();
        if mode == BridgeMode::Inactive {
            return Err(BridgeError::InvalidConfig(
                "mode must be transmit or receive before networking starts".into(),
            ));
        }

        let config = self.shared.config.lock().clone();
        config.validate()?;
        self.shared
            .queue
            .set_capacity(QUEUE_PACKETS * config.floats_per_packet());

        // Clock recovery comes up first; a bridge without its clock is not
        // worth putting on the wire.
        let ptp = PtpSlave::start(PtpConfig {
            interface: config.interface,
            sample_rate: config.sample_rate,
            ..PtpConfig::default()
        })?;

        let network = match NetworkManager::new(&config) {
            Ok(network) => network,
            Err(e) => {
                let mut ptp = ptp;
                ptp.shutdown();
                return Err(e);
            }
        };

        let codec = SampleCodec::new(config.bit_depth, config.channels)?;
        let session = RtpSession::new(
            config.payload_type,
            config.channels,
            config.bytes_per_sample(),
            self.shared.counters.clone(),
        );

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let worker = if mode == BridgeMode::Receive {
            thread::spawn(move || receive_loop(shared, network, session, codec, config))
        } else {
            thread::spawn(move || transmit_loop(shared, network, session, codec, config))
        };

        self.ptp = Some(ptp);
        self.worker = Some(worker);
        self.shared.network_active.store(true, Ordering::SeqCst);
        info!(?mode, "networking started");
        Ok(())
    }

    /// Stop the worker, the sockets and PTP. A second call is a no-op.
    pub fn stop_networking(&mut self) {
        if !self.shared.network_active.load(Ordering::SeqCst) {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(mut ptp) = self.ptp.take() {
            ptp.shutdown();
        }
        self.shared.queue.clear();
        self.shared.set_buffer_level(0.0);
        self.shared.network_active.store(false, Ordering::SeqCst);
        info!("networking stopped");
    }

    pub fn is_network_active(&self) -> bool {
        self.shared.network_active.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> BridgeMode {
        self.shared.mode()
    }

    /// Queue fill level relative to capacity, 0.0..=1.0.
    pub fn buffer_level(&self) -> f32 {
        self.shared.buffer_level()
    }

    pub fn rtp_stats(&self) -> RtpStats {
        self.shared.counters.snapshot()
    }

    pub fn ptp_status(&self) -> Option<PtpStatus> {
        self.ptp.as_ref().map(|ptp| ptp.status())
    }

    pub fn config(&self) -> StreamConfig {
        self.shared.config.lock().clone()
    }
}

impl Drop for Aes67Bridge {
    fn drop(&mut self) {
        self.stop_networking();
    }
}

/// The audio callback body. One short critical section on the queue per
/// invocation; everything else is slice copies in the caller's buffers.
fn process_block(shared: &BridgeShared, block: &mut AudioBlock<'_, '_>, scratch: &mut Vec<f32>) {
    let frames = block.frames;
    let mode = shared.mode();
    let active = shared.network_active.load(Ordering::SeqCst);

    match (mode, active) {
        (BridgeMode::Transmit, true) => {
            let channels = block.inputs.len();
            scratch.resize(frames * channels, 0.0);
            for (ch, input) in block.inputs.iter().enumerate() {
                for i in 0..frames {
                    scratch[i * channels + ch] = input[i];
                }
            }
            shared.queue.push_slice(&scratch[..frames * channels]);
            shared.set_buffer_level(shared.queue.level());
            // Monitor what is being sent.
            pass_through(block);
        }
        (BridgeMode::Receive, true) => {
            let channels = block.outputs.len();
            scratch.resize(frames * channels, 0.0);
            if shared.queue.pop_slice(&mut scratch[..frames * channels]) {
                for (ch, output) in block.outputs.iter_mut().enumerate() {
                    for i in 0..frames {
                        output[i] = scratch[i * channels + ch];
                    }
                }
            } else {
                // Underrun: silence beats stale audio.
                for output in block.outputs.iter_mut() {
                    output[..frames].fill(0.0);
                }
            }
            shared.set_buffer_level(shared.queue.level());
        }
        _ => pass_through(block),
    }
}

fn pass_through(block: &mut AudioBlock<'_, '_>) {
    let frames = block.frames;
    for (ch, output) in block.outputs.iter_mut().enumerate() {
        match block.inputs.get(ch) {
            Some(input) => output[..frames].copy_from_slice(&input[..frames]),
            None => output[..frames].fill(0.0),
        }
    }
}

fn is_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Receive worker: socket -> parser -> reorder window -> codec -> queue.
fn receive_loop(
    shared: Arc<BridgeShared>,
    network: NetworkManager,
    session: RtpSession,
    codec: SampleCodec,
    config: StreamConfig,
) {
    let mut reorder = ReorderBuffer::new(session.counters().clone());
    let mut buf = [0u8; 2048];
    let mut samples: Vec<f32> = Vec::new();
    let mut current_ssrc: Option<u32> = None;

    while shared.running.load(Ordering::SeqCst) {
        match network.recv(&mut buf) {
            Ok(len) => {
                let packet = match session.parse_packet(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(_) => {
                        session
                            .counters()
                            .packets_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                if packet.payload_type != config.payload_type {
                    continue;
                }
                if current_ssrc != Some(packet.ssrc) {
                    if current_ssrc.is_some() {
                        info!(ssrc = packet.ssrc, "stream source changed, resynchronising");
                        reorder.reset();
                    }
                    current_ssrc = Some(packet.ssrc);
                }
                reorder.push(packet.sequence, packet.payload);
                drain_reorder(&shared, &mut reorder, &codec, &mut samples);
            }
            Err(ref e) if is_timeout(e) => {
                // Socket gone quiet with packets parked behind a gap: the
                // missing ones are not coming, move on.
                if reorder.buffered() > 0 && reorder.skip_gap() {
                    drain_reorder(&shared, &mut reorder, &codec, &mut samples);
                }
            }
            Err(e) => warn!("receive failed: {e}"),
        }
    }
}

fn drain_reorder(
    shared: &BridgeShared,
    reorder: &mut ReorderBuffer,
    codec: &SampleCodec,
    samples: &mut Vec<f32>,
) {
    while let Some(payload) = reorder.pop_ready() {
        codec.decode(&payload, samples);
        shared.queue.push_slice(samples);
    }
    shared.set_buffer_level(shared.queue.level());
}

/// Transmit worker: queue -> codec -> packet builder -> socket, one packet
/// per packet time. Soft-timed; the queue arbitrates the true rate.
fn transmit_loop(
    shared: Arc<BridgeShared>,
    network: NetworkManager,
    mut session: RtpSession,
    mut codec: SampleCodec,
    config: StreamConfig,
) {
    let samples_per_packet = config.samples_per_packet();
    let mut frame = vec![0.0f32; config.floats_per_packet()];
    let mut payload: Vec<u8> = Vec::with_capacity(config.payload_bytes());
    let interval = Duration::from_micros(u64::from(config.packet_time_us));

    while shared.running.load(Ordering::SeqCst) {
        if !shared.queue.pop_slice(&mut frame) {
            thread::sleep(TX_POLL);
            continue;
        }
        codec.encode(&frame, &mut payload);
        match session.build_packet(&payload, samples_per_packet as u32) {
            Ok(packet) => {
                if let Err(e) = network.send(&packet) {
                    warn!("send failed: {e}");
                }
            }
            Err(e) => warn!("packet build failed: {e}"),
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::session::RtpSession;
    use std::net::UdpSocket;

    fn test_shared(mode: BridgeMode, active: bool, capacity: usize) -> Arc<BridgeShared> {
        Arc::new(BridgeShared {
            config: Mutex::new(StreamConfig::default()),
            mode: AtomicU8::new(mode as u8),
            running: AtomicBool::new(false),
            network_active: AtomicBool::new(active),
            queue: SampleQueue::new(capacity),
            counters: Arc::new(RtpCounters::default()),
            buffer_level: AtomicU32::new(0),
        })
    }

    fn run_callback(
        shared: &BridgeShared,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        frames: usize,
    ) {
        let mut scratch = Vec::new();
        let input_refs: Vec<&[f32]> = inputs.iter().map(|c| c.as_slice()).collect();
        let mut output_refs: Vec<&mut [f32]> =
            outputs.iter_mut().map(|c| c.as_mut_slice()).collect();
        let mut block = AudioBlock {
            frames,
            inputs: input_refs.as_slice(),
            outputs: output_refs.as_mut_slice(),
        };
        process_block(shared, &mut block, &mut scratch);
    }

    #[test]
    fn inactive_mode_passes_audio_through() {
        let shared = test_shared(BridgeMode::Inactive, false, 64);
        let inputs = vec![vec![0.1f32, 0.2], vec![0.3, 0.4]];
        let mut outputs = vec![vec![0.0f32; 2], vec![0.0f32; 2]];
        run_callback(&shared, &inputs, &mut outputs, 2);
        assert_eq!(outputs[0], vec![0.1, 0.2]);
        assert_eq!(outputs[1], vec![0.3, 0.4]);
        assert!(shared.queue.is_empty());
    }

    #[test]
    fn transmit_callback_queues_and_monitors() {
        let shared = test_shared(BridgeMode::Transmit, true, 64);
        let inputs = vec![vec![1.0f32, 3.0], vec![2.0, 4.0]];
        let mut outputs = vec![vec![0.0f32; 2], vec![0.0f32; 2]];
        run_callback(&shared, &inputs, &mut outputs, 2);

        // Interleaved frame-major ordering in the queue.
        let mut queued = [0.0f32; 4];
        assert!(shared.queue.pop_slice(&mut queued));
        assert_eq!(queued, [1.0, 2.0, 3.0, 4.0]);
        // Input is monitored straight to the output.
        assert_eq!(outputs[0], vec![1.0, 3.0]);
        assert_eq!(outputs[1], vec![2.0, 4.0]);
    }

    #[test]
    fn receive_callback_pops_or_zeroes() {
        let shared = test_shared(BridgeMode::Receive, true, 64);
        let inputs = vec![vec![9.0f32; 2], vec![9.0f32; 2]];

        // Underrun first: output must be silence, queue untouched.
        let mut outputs = vec![vec![7.0f32; 2], vec![7.0f32; 2]];
        run_callback(&shared, &inputs, &mut outputs, 2);
        assert_eq!(outputs[0], vec![0.0, 0.0]);
        assert_eq!(outputs[1], vec![0.0, 0.0]);

        shared.queue.push_slice(&[1.0, 2.0, 3.0, 4.0]);
        run_callback(&shared, &inputs, &mut outputs, 2);
        assert_eq!(outputs[0], vec![1.0, 3.0]);
        assert_eq!(outputs[1], vec![2.0, 4.0]);
        assert!(shared.queue.is_empty());
    }

    #[test]
    fn one_packet_reaches_the_sink() {
        // 48 frames of stereo L24 all encoding 0.5 (0x3FFFFF).
        let config = StreamConfig::default();
        let counters = Arc::new(RtpCounters::default());
        let mut payload = Vec::new();
        for _ in 0..config.floats_per_packet() {
            payload.extend_from_slice(&[0x3F, 0xFF, 0xFF]);
        }

        let mut tx = RtpSession::with_ssrc(0xDEAD_BEEF, 96, 2, 3, counters.clone());
        tx.seed_wire_state(42, 0);
        let packet = tx.build_packet(&payload, 48).unwrap();

        let rx = RtpSession::with_ssrc(1, 96, 2, 3, counters.clone());
        let parsed = rx.parse_packet(&packet).unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.ssrc, 0xDEAD_BEEF);
        assert_eq!(parsed.frames, 48);

        let shared = test_shared(BridgeMode::Receive, true, 20 * 96);
        let codec = SampleCodec::new(BitDepth::Pcm24, 2).unwrap();
        let mut reorder = ReorderBuffer::new(counters);
        let mut samples = Vec::new();
        reorder.push(parsed.sequence, parsed.payload);
        drain_reorder(&shared, &mut reorder, &codec, &mut samples);
        assert_eq!(shared.queue.len(), 96);

        let mut sink = vec![0.0f32; 96];
        assert!(shared.queue.pop_slice(&mut sink));
        for sample in sink {
            assert!((0.4999..=0.5001).contains(&sample), "sample {sample}");
        }
    }

    #[test]
    fn transmit_pacing_emits_consecutive_packets() {
        // 480 stereo frames queued -> exactly ten 1 ms packets.
        let config = StreamConfig::default();
        let shared = test_shared(BridgeMode::Transmit, true, 20 * 96);
        shared.queue.push_slice(&vec![0.25f32; 960]);

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();

        let mut codec = SampleCodec::new(config.bit_depth, config.channels).unwrap();
        let mut session = RtpSession::with_ssrc(
            7,
            config.payload_type,
            config.channels,
            config.bytes_per_sample(),
            shared.counters.clone(),
        );

        let mut frame = vec![0.0f32; config.floats_per_packet()];
        let mut payload = Vec::new();
        let mut sent = 0u32;
        while shared.queue.pop_slice(&mut frame) {
            codec.encode(&frame, &mut payload);
            let packet = session
                .build_packet(&payload, config.samples_per_packet() as u32)
                .unwrap();
            sender.send(&packet).unwrap();
            sent += 1;
        }
        assert_eq!(sent, 10);
        assert_eq!(shared.counters.snapshot().packets_sent, 10);

        let parse = RtpSession::with_ssrc(1, 96, 2, 3, Arc::new(RtpCounters::default()));
        let mut buf = [0u8; 2048];
        for i in 0..10u32 {
            let len = receiver.recv(&mut buf).unwrap();
            let packet = parse.parse_packet(&buf[..len]).unwrap();
            assert_eq!(packet.sequence, i as u16);
            assert_eq!(packet.timestamp, i * 48);
            assert_eq!(packet.ssrc, 7);
            assert_eq!(packet.frames, 48);
        }
    }

    #[test]
    fn setters_fail_while_active() {
        let bridge = Aes67Bridge::new(StreamConfig::default()).unwrap();
        bridge.shared.network_active.store(true, Ordering::SeqCst);

        assert!(matches!(
            bridge.set_mode(BridgeMode::Receive),
            Err(BridgeError::Busy)
        ));
        assert!(matches!(bridge.set_bit_depth(16), Err(BridgeError::Busy)));
        assert!(matches!(
            bridge.set_packet_time(250),
            Err(BridgeError::Busy)
        ));
        assert!(matches!(
            bridge.set_network_address(Ipv4Addr::new(239, 1, 2, 3), 5004),
            Err(BridgeError::Busy)
        ));
        assert!(matches!(
            bridge.set_network_interface(Ipv4Addr::new(192, 168, 1, 2)),
            Err(BridgeError::Busy)
        ));
        bridge.shared.network_active.store(false, Ordering::SeqCst);
    }

    #[test]
    fn start_requires_a_mode() {
        let mut bridge = Aes67Bridge::new(StreamConfig::default()).unwrap();
        assert!(matches!(
            bridge.start_networking(),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut bridge = Aes67Bridge::new(StreamConfig::default()).unwrap();
        bridge.stop_networking();
        bridge.stop_networking();
        assert!(!bridge.is_network_active());
    }

    #[test]
    fn setters_validate_values() {
        let bridge = Aes67Bridge::new(StreamConfig::default()).unwrap();
        assert!(bridge.set_bit_depth(20).is_err());
        assert!(bridge.set_packet_time(999).is_err());
        assert!(bridge
            .set_network_address(Ipv4Addr::new(10, 0, 0, 1), 5004)
            .is_err());
        // Valid values stick.
        bridge.set_bit_depth(16).unwrap();
        bridge.set_packet_time(250).unwrap();
        let config = bridge.config();
        assert_eq!(config.bit_depth.bits(), 16);
        assert_eq!(config.packet_time_us, 250);
    }
}
