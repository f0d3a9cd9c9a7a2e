//! Multicast UDP socket layer
//!
//! Thin wrappers around `std::net::UdpSocket` configured through
//! `socket2` for the options the std API does not expose. Transport
//! errors surface as `io::Error` to the pipelines, which count them and
//! keep running.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Suggested kernel receive buffer for audio reception
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Kernel send buffer for audio transmission
const SEND_BUFFER_SIZE: usize = 1024 * 1024;

/// Default multicast TTL for AES67 streams
pub const DEFAULT_TTL: u8 = 32;

/// Non-blocking multicast UDP receiver
///
/// Joins the group on open and leaves it again on drop; drop is
/// idempotent with respect to the joined group.
pub struct MulticastReceiver {
    socket: UdpSocket,
    group: Ipv4Addr,
    interface: Ipv4Addr,
}

impl MulticastReceiver {
    /// Open a receiver socket for `group:port`
    ///
    /// Enables address (and, where supported, port) reuse, binds the
    /// wildcard address, joins the multicast group on `interface` (or
    /// the default interface), sets the socket non-blocking and
    /// enlarges the kernel receive buffer.
    ///
    /// # Errors
    ///
    /// Returns the underlying `io::Error` on socket creation, bind or
    /// group join failure.
    pub fn open(group: Ipv4Addr, port: u16, interface: Option<Ipv4Addr>) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;

        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            tracing::warn!("could not enlarge receive buffer: {e}");
        }

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind_addr.into())?;

        let interface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_nonblocking(true)?;

        tracing::debug!("receiver joined {group}:{port} on {interface}");

        Ok(Self {
            socket: socket.into(),
            group,
            interface,
        })
    }

    /// Receive up to one datagram into `buf`
    ///
    /// # Errors
    ///
    /// `WouldBlock` when no datagram is pending; other errors are
    /// transport faults the caller counts.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    /// The joined multicast group
    #[must_use]
    pub fn group(&self) -> Ipv4Addr {
        self.group
    }
}

impl Drop for MulticastReceiver {
    fn drop(&mut self) {
        let _ = self.socket.leave_multicast_v4(&self.group, &self.interface);
    }
}

/// Multicast UDP transmitter
pub struct MulticastTransmitter {
    socket: UdpSocket,
    dest: SocketAddrV4,
}

impl MulticastTransmitter {
    /// Open a transmitter socket toward `group:port`
    ///
    /// Sets the multicast TTL, enables local loopback of sent packets,
    /// optionally pins the outgoing interface, and enlarges the kernel
    /// send buffer.
    ///
    /// # Errors
    ///
    /// Returns the underlying `io::Error` on socket creation or option
    /// failure.
    pub fn open(
        group: Ipv4Addr,
        port: u16,
        ttl: u8,
        interface: Option<Ipv4Addr>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_multicast_ttl_v4(u32::from(ttl))?;
        socket.set_multicast_loop_v4(true)?;

        if let Some(iface) = interface {
            socket.set_multicast_if_v4(&iface)?;
        }

        if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
            tracing::warn!("could not enlarge send buffer: {e}");
        }

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&bind_addr.into())?;

        tracing::debug!("transmitter targeting {group}:{port} with ttl {ttl}");

        Ok(Self {
            socket: socket.into(),
            dest: SocketAddrV4::new(group, port),
        })
    }

    /// Send one datagram to the stored destination
    ///
    /// # Errors
    ///
    /// Transport faults the caller counts; they do not terminate the
    /// pipeline.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, self.dest)
    }

    /// The destination endpoint
    #[must_use]
    pub fn dest(&self) -> SocketAddrV4 {
        self.dest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmitter_open_sets_destination() {
        let tx =
            MulticastTransmitter::open(Ipv4Addr::new(239, 1, 1, 1), 5004, DEFAULT_TTL, None)
                .unwrap();
        assert_eq!(*tx.dest().ip(), Ipv4Addr::new(239, 1, 1, 1));
        assert_eq!(tx.dest().port(), 5004);
    }

    #[test]
    #[ignore = "requires a multicast-capable network interface"]
    fn test_receiver_round_trip_on_loopback() {
        let group = Ipv4Addr::new(239, 254, 1, 1);
        let rx = MulticastReceiver::open(group, 6104, None).unwrap();
        let tx = MulticastTransmitter::open(group, 6104, 1, None).unwrap();

        tx.send(b"hello aes67").unwrap();

        let mut buf = [0u8; 64];
        // Non-blocking receive: poll briefly for the looped-back datagram
        let mut received = 0;
        for _ in 0..100 {
            match rx.recv(&mut buf) {
                Ok((n, _)) => {
                    received = n;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        assert_eq!(&buf[..received], b"hello aes67");
    }

    #[test]
    #[ignore = "requires a multicast-capable network interface"]
    fn test_receiver_nonblocking_returns_wouldblock() {
        let rx = MulticastReceiver::open(Ipv4Addr::new(239, 254, 1, 2), 6105, None).unwrap();
        let mut buf = [0u8; 16];
        let err = rx.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
