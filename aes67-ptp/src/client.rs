//! PTP slave engine.
//!
//! One thread reads the event port (Sync), a second reads the general port
//! (Follow_Up, Delay_Resp). Both feed shared state that tracks one
//! outstanding Sync exchange and one outstanding Delay_Req exchange; an
//! unmatched exchange is simply forgotten when a newer one supersedes it.
//! The recovered offset is published atomically in audio samples.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::messages::{body_timestamp, ClockIdentity, DelayReq, MessageType, PortIdentity, PtpHeader, PtpTimestamp};
use crate::stats::PtpStatus;
use crate::PtpError;

/// PTP primary multicast group.
pub const PTP_PRIMARY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);
/// Event port (Sync in, Delay_Req out).
pub const PTP_EVENT_PORT: u16 = 319;
/// General port (Follow_Up, Delay_Resp in).
pub const PTP_GENERAL_PORT: u16 = 320;

/// Read timeout on both sockets, bounding shutdown latency.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Slave configuration, fixed for the lifetime of the slave.
#[derive(Debug, Clone)]
pub struct PtpConfig {
    /// Multicast group both endpoints join.
    pub group: Ipv4Addr,
    /// IPv4 address of the local interface, or any.
    pub interface: Option<Ipv4Addr>,
    /// PTP domain; messages from other domains are ignored.
    pub domain: u8,
    /// Audio sample rate; all recovered times are expressed in samples of it.
    pub sample_rate: u32,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            group: PTP_PRIMARY_GROUP,
            interface: None,
            domain: 0,
            sample_rate: 48_000,
        }
    }
}

/// In-flight exchange bookkeeping, shared between the two reader threads.
#[derive(Default)]
struct Exchange {
    /// Sequence of the last two-step Sync, waiting for its Follow_Up.
    sync_sequence: u16,
    awaiting_follow_up: bool,
    /// Master send time of the last completed Sync, in samples.
    t1: i64,
    /// Local receive time of that Sync (or its Follow_Up), in samples.
    t2: i64,
    /// Local send time of the outstanding Delay_Req, in samples.
    t3: i64,
    delay_sequence: u16,
    awaiting_delay_resp: bool,
}

pub(crate) struct PtpShared {
    sample_rate: u32,
    domain: u8,
    epoch: Instant,
    synchronized: AtomicBool,
    offset_samples: AtomicI64,
    master_seconds: AtomicU64,
    master_nanoseconds: AtomicU32,
    local_timestamp_samples: AtomicI64,
    sync_count: AtomicU64,
    follow_up_count: AtomicU64,
    delay_resp_count: AtomicU64,
    master_id: Mutex<String>,
    exchange: Mutex<Exchange>,
    request_socket: Mutex<Option<UdpSocket>>,
    request_dest: SocketAddrV4,
    local_port: PortIdentity,
}

impl PtpShared {
    fn new(config: &PtpConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            domain: config.domain,
            epoch: Instant::now(),
            synchronized: AtomicBool::new(false),
            offset_samples: AtomicI64::new(0),
            master_seconds: AtomicU64::new(0),
            master_nanoseconds: AtomicU32::new(0),
            local_timestamp_samples: AtomicI64::new(0),
            sync_count: AtomicU64::new(0),
            follow_up_count: AtomicU64::new(0),
            delay_resp_count: AtomicU64::new(0),
            master_id: Mutex::new(String::new()),
            exchange: Mutex::new(Exchange::default()),
            request_socket: Mutex::new(None),
            request_dest: SocketAddrV4::new(config.group, PTP_EVENT_PORT),
            local_port: PortIdentity {
                clock_identity: ClockIdentity(rand::random::<u64>().to_be_bytes()),
                port_number: 1,
            },
        }
    }

    /// Monotonic local time in samples since the slave started.
    fn now_samples(&self) -> i64 {
        let elapsed = self.epoch.elapsed().as_nanos();
        ((elapsed * self.sample_rate as u128) / 1_000_000_000) as i64
    }

    fn status(&self) -> PtpStatus {
        PtpStatus {
            master_id: self.master_id.lock().map(|m| m.clone()).unwrap_or_default(),
            synchronized: self.synchronized.load(Ordering::SeqCst),
            offset_samples: self.offset_samples.load(Ordering::SeqCst),
            master_seconds: self.master_seconds.load(Ordering::Relaxed),
            master_nanoseconds: self.master_nanoseconds.load(Ordering::Relaxed),
            local_timestamp_samples: self.local_timestamp_samples.load(Ordering::Relaxed),
            sync_count: self.sync_count.load(Ordering::Relaxed),
            follow_up_count: self.follow_up_count.load(Ordering::Relaxed),
            delay_resp_count: self.delay_resp_count.load(Ordering::Relaxed),
        }
    }

    fn handle_sync(&self, header: &PtpHeader, data: &[u8], t2: i64) {
        let rendered = header.source_port.clock_identity.to_string();
        if let Ok(mut master) = self.master_id.lock() {
            if *master != rendered {
                info!(master = %rendered, "new PTP master clock");
                *master = rendered;
                self.synchronized.store(false, Ordering::SeqCst);
            }
        }
        self.sync_count.fetch_add(1, Ordering::Relaxed);

        if header.is_two_step() {
            // Precise origin timestamp arrives in the Follow_Up.
            if let Ok(mut exchange) = self.exchange.lock() {
                exchange.sync_sequence = header.sequence_id;
                exchange.awaiting_follow_up = true;
            }
        } else if let Some(ts) = body_timestamp(data) {
            self.complete_sync(ts, t2);
        }
    }

    fn handle_follow_up(&self, header: &PtpHeader, data: &[u8], t2: i64) {
        let matched = self
            .exchange
            .lock()
            .map(|e| e.awaiting_follow_up && e.sync_sequence == header.sequence_id)
            .unwrap_or(false);
        if !matched {
            return;
        }
        let Some(ts) = body_timestamp(data) else {
            return;
        };
        self.follow_up_count.fetch_add(1, Ordering::Relaxed);
        self.complete_sync(ts, t2);
    }

    /// Record t1/t2 of a completed Sync exchange and kick off the delay
    /// measurement leg.
    fn complete_sync(&self, ts: PtpTimestamp, t2: i64) {
        let t1 = ts.to_samples(self.sample_rate);
        self.master_seconds.store(ts.seconds, Ordering::Relaxed);
        self.master_nanoseconds.store(ts.nanoseconds, Ordering::Relaxed);
        self.local_timestamp_samples.store(t2, Ordering::Relaxed);
        if let Ok(mut exchange) = self.exchange.lock() {
            exchange.t1 = t1;
            exchange.t2 = t2;
            exchange.awaiting_follow_up = false;
        }
        self.send_delay_request();
        self.synchronized.store(true, Ordering::SeqCst);
    }

    fn handle_delay_resp(&self, header: &PtpHeader, data: &[u8]) {
        let Some(ts) = body_timestamp(data) else {
            return;
        };
        let offset = {
            let Ok(mut exchange) = self.exchange.lock() else {
                return;
            };
            if !exchange.awaiting_delay_resp || exchange.delay_sequence != header.sequence_id {
                return;
            }
            exchange.awaiting_delay_resp = false;
            let t4 = ts.to_samples(self.sample_rate);
            ((exchange.t2 - exchange.t1) + (t4 - exchange.t3)) / 2
        };
        self.offset_samples.store(offset, Ordering::SeqCst);
        self.delay_resp_count.fetch_add(1, Ordering::Relaxed);
        debug!(offset, "PTP clock offset updated (samples)");
    }

    fn send_delay_request(&self) {
        let sequence = match self.exchange.lock() {
            Ok(mut exchange) => {
                exchange.delay_sequence = exchange.delay_sequence.wrapping_add(1);
                exchange.delay_sequence
            }
            Err(_) => return,
        };
        let message = DelayReq {
            source_port: self.local_port,
            domain: self.domain,
            sequence_id: sequence,
        };
        let sent = match self.request_socket.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(socket) => socket.send_to(&message.to_bytes(), self.request_dest).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
        if sent {
            let t3 = self.now_samples();
            self.note_delay_request(sequence, t3);
        } else {
            warn!("failed to send PTP delay request");
        }
    }

    /// Mark a Delay_Req as outstanding with its local send time.
    fn note_delay_request(&self, sequence: u16, t3: i64) {
        if let Ok(mut exchange) = self.exchange.lock() {
            exchange.delay_sequence = sequence;
            exchange.t3 = t3;
            exchange.awaiting_delay_resp = true;
        }
    }
}

/// Handle to the running slave. Dropping it stops the reader threads.
pub struct PtpSlave {
    shared: Arc<PtpShared>,
    running: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
    general_thread: Option<JoinHandle<()>>,
}

impl PtpSlave {
    /// Bind both endpoints, join the multicast group and start the reader
    /// threads.
    pub fn start(config: PtpConfig) -> Result<Self, PtpError> {
        let event_socket = bind_ptp_socket(&config, PTP_EVENT_PORT)?;
        let general_socket = bind_ptp_socket(&config, PTP_GENERAL_PORT)?;

        let shared = Arc::new(PtpShared::new(&config));
        let request = event_socket.try_clone().map_err(PtpError::Socket)?;
        if let Ok(mut guard) = shared.request_socket.lock() {
            *guard = Some(request);
        }

        let running = Arc::new(AtomicBool::new(true));

        let event_shared = shared.clone();
        let event_running = running.clone();
        let event_thread = thread::spawn(move || {
            run_event_loop(event_socket, event_shared, event_running);
        });

        let general_shared = shared.clone();
        let general_running = running.clone();
        let general_thread = thread::spawn(move || {
            run_general_loop(general_socket, general_shared, general_running);
        });

        info!(group = %config.group, domain = config.domain, "PTP slave started");
        Ok(Self {
            shared,
            running,
            event_thread: Some(event_thread),
            general_thread: Some(general_thread),
        })
    }

    /// Current status snapshot.
    pub fn status(&self) -> PtpStatus {
        self.shared.status()
    }

    /// Master clock offset in audio samples, signed.
    pub fn offset_samples(&self) -> i64 {
        self.shared.offset_samples.load(Ordering::SeqCst)
    }

    pub fn is_synchronized(&self) -> bool {
        self.shared.synchronized.load(Ordering::SeqCst)
    }

    /// Grandmaster identity string; empty until the first Sync is seen.
    pub fn master_clock_id(&self) -> String {
        self.shared
            .master_id
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Stop both reader threads and drop the sockets. Idempotent; bounded
    /// by the socket read timeout.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.event_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.general_thread.take() {
            let _ = thread.join();
        }
        if let Ok(mut guard) = self.shared.request_socket.lock() {
            *guard = None;
        }
        self.shared.synchronized.store(false, Ordering::SeqCst);
    }
}

impl Drop for PtpSlave {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_ptp_socket(config: &PtpConfig, port: u16) -> Result<UdpSocket, PtpError> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .map_err(|source| PtpError::Bind { port, source })?;
    let interface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket
        .join_multicast_v4(&config.group, &interface)
        .map_err(PtpError::MulticastJoin)?;
    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .map_err(PtpError::Socket)?;
    Ok(socket)
}

fn is_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Event port reader: Sync messages.
fn run_event_loop(socket: UdpSocket, shared: Arc<PtpShared>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; 1500];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(len) => {
                let t2 = shared.now_samples();
                let Some(header) = PtpHeader::parse(&buf[..len]) else {
                    continue;
                };
                if header.version != 2 || header.domain != shared.domain {
                    continue;
                }
                if header.message_type == MessageType::Sync {
                    shared.handle_sync(&header, &buf[..len], t2);
                }
            }
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    warn!("PTP event socket receive failed: {e}");
                }
            }
        }
    }
}

/// General port reader: Follow_Up and Delay_Resp messages.
fn run_general_loop(socket: UdpSocket, shared: Arc<PtpShared>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; 1500];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(len) => {
                let t2 = shared.now_samples();
                let Some(header) = PtpHeader::parse(&buf[..len]) else {
                    continue;
                };
                if header.version != 2 || header.domain != shared.domain {
                    continue;
                }
                match header.message_type {
                    MessageType::FollowUp => shared.handle_follow_up(&header, &buf[..len], t2),
                    MessageType::DelayResp => shared.handle_delay_resp(&header, &buf[..len]),
                    _ => {}
                }
            }
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    warn!("PTP general socket receive failed: {e}");
                }
            }
        }
    }
}
