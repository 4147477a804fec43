//! Multicast UDP plumbing for the RTP stream.
//!
//! One receive socket bound to the stream port and joined to the group, one
//! transmit socket connected to the group with media-grade TTL and DSCP.
//! Both end up as plain `std` sockets once configured.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::config::StreamConfig;
use crate::error::BridgeError;

/// Multicast TTL on the transmit socket.
const MULTICAST_TTL: u32 = 32;
/// DSCP AF41 expressed in the TOS byte, the class AES67 media expects.
const DSCP_AF41_TOS: u32 = 0x88;
/// Receive timeout so workers can observe the running flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Paired transmit/receive sockets bound to one multicast group.
pub struct NetworkManager {
    send_socket: UdpSocket,
    recv_socket: UdpSocket,
}

impl NetworkManager {
    /// Open both sockets, join the group and connect the sender.
    pub fn new(config: &StreamConfig) -> Result<Self, BridgeError> {
        let recv_socket = create_recv_socket(config).map_err(|e| {
            BridgeError::NetworkInit(format!(
                "receive socket on {}:{}: {e}",
                config.group, config.port
            ))
        })?;
        let send_socket = create_send_socket(config).map_err(|e| {
            BridgeError::NetworkInit(format!(
                "transmit socket to {}:{}: {e}",
                config.group, config.port
            ))
        })?;
        Ok(Self {
            send_socket,
            recv_socket,
        })
    }

    /// Send one packet to the group.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.send_socket.send(data)
    }

    /// Receive one packet. Times out with `WouldBlock`/`TimedOut` so the
    /// caller can poll its running flag.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_socket.recv(buf)
    }
}

fn create_recv_socket(config: &StreamConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
    let interface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(&config.group, &interface)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    Ok(socket.into())
}

fn create_send_socket(config: &StreamConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let local = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.bind(&SocketAddrV4::new(local, 0).into())?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    if let Some(interface) = config.interface {
        socket.set_multicast_if_v4(&interface)?;
    }
    if let Err(e) = socket.set_tos(DSCP_AF41_TOS) {
        // QoS marking is best effort; plenty of stacks refuse it.
        warn!("could not set DSCP on transmit socket: {e}");
    }
    let _ = socket.set_send_buffer_size(1024 * 1024);
    let socket: UdpSocket = socket.into();
    socket.connect(SocketAddrV4::new(config.group, config.port))?;
    Ok(socket)
}
