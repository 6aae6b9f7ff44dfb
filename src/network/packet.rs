//! `AF_PACKET` transport for hosts without an IPv4 address.
//!
//! One datagram socket is bound to an interface for `ETH_P_IP` and shared by
//! every connection handed out; connections only differ in the addresses
//! written into the IPv4/UDP headers. Frames always go to the broadcast
//! hardware address.

use super::{
    frame::{self, Datagram, IP_PROTO_UDP, MAX_IP_HEADER_LEN, UDP_HEADER_LEN},
    remaining,
    udp::DEFAULT_REMOTE_ADDR,
    Connection, Transport, TransportError,
};
use crate::error::MultiError;
use rand::{rngs::OsRng, TryRngCore};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io::{self, Read},
    mem,
    net::SocketAddrV4,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

const BROADCAST_MAC: [u8; 6] = [0xff; 6];
/// Longest single wait in `recv`. Packet sockets cannot be shut down, so a
/// blocked reader only sees `close()` when its wait ends.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fills the IPv4 identification field of outgoing frames.
pub type IdSource = Arc<dyn Fn(&mut [u8]) -> io::Result<()> + Send + Sync>;

fn os_random(buf: &mut [u8]) -> io::Result<()> {
    OsRng.try_fill_bytes(buf).map_err(io::Error::other)
}

fn eth_p_ip() -> u16 {
    (libc::ETH_P_IP as u16).to_be()
}

/// Builds a `sockaddr_ll` for `ifindex`, optionally addressed to `hw_addr`.
fn link_addr(ifindex: i32, hw_addr: Option<[u8; 6]>) -> SockAddr {
    // SAFETY: an all-zero `sockaddr_storage` is valid, and it is large and
    // aligned enough to be viewed as a `sockaddr_ll`.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let ll = &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>();
        ll.sll_family = libc::AF_PACKET as libc::sa_family_t;
        ll.sll_protocol = eth_p_ip();
        ll.sll_ifindex = ifindex;
        if let Some(hw_addr) = hw_addr {
            ll.sll_halen = hw_addr.len() as u8;
            ll.sll_addr[..hw_addr.len()].copy_from_slice(&hw_addr);
        }
        SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
    }
}

struct PacketSocket {
    socket: Socket,
    ifindex: i32,
    id_source: IdSource,
    closed: AtomicBool,
}

/// Link-layer transport bound to a single interface.
#[derive(Clone)]
pub struct PacketTransport {
    inner: Arc<PacketSocket>,
}

impl PacketTransport {
    /// Opens and binds the packet socket. Needs `CAP_NET_RAW`.
    pub fn new(ifindex: i32) -> Result<Self, TransportError> {
        Self::with_id_source(ifindex, Arc::new(os_random))
    }

    /// Like [`PacketTransport::new`] with a custom identification source.
    pub fn with_id_source(ifindex: i32, id_source: IdSource) -> Result<Self, TransportError> {
        let socket = Socket::new(
            Domain::from(libc::AF_PACKET),
            Type::DGRAM,
            Some(Protocol::from(i32::from(eth_p_ip()))),
        )
        .map_err(TransportError::CreateSocket)?;
        socket
            .bind(&link_addr(ifindex, None))
            .map_err(|source| TransportError::BindSocket {
                addr: format!("ifindex {ifindex}"),
                source,
            })?;
        tracing::debug!("Bound packet socket to interface index {}", ifindex);

        Ok(Self {
            inner: Arc::new(PacketSocket {
                socket,
                ifindex,
                id_source,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn ifindex(&self) -> i32 {
        self.inner.ifindex
    }

    fn connect(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Result<Box<dyn Connection>, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(PacketConnection {
            inner: self.inner.clone(),
            local,
            remote,
            read_deadline: None,
            write_deadline: None,
        }))
    }
}

impl Transport for PacketTransport {
    fn dial(
        &self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<Box<dyn Connection>, TransportError> {
        self.connect(local, remote)
    }

    fn listen(&self, local: SocketAddrV4) -> Result<Box<dyn Connection>, TransportError> {
        self.connect(local, DEFAULT_REMOTE_ADDR)
    }

    fn close(&self) -> Result<(), MultiError> {
        self.inner.closed.store(true, Ordering::Release);
        // Packet sockets do not support shutdown; blocked readers notice the
        // flag within one poll interval. The descriptor goes with the last
        // handle.
        let mut errors = MultiError::new();
        match self.inner.socket.shutdown(std::net::Shutdown::Both) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::EOPNOTSUPP) | Some(libc::ENOTCONN)) => {}
            other => errors.push(other),
        }
        errors.into_result()
    }
}

/// A view of the shared packet socket with its own addresses and deadlines.
pub struct PacketConnection {
    inner: Arc<PacketSocket>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl PacketConnection {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn map_err(&self, err: io::Error) -> TransportError {
        if self.inner.closed.load(Ordering::Acquire) {
            TransportError::Closed
        } else {
            TransportError::from_io(err)
        }
    }

    /// Applies the read deadline, capped at [`CLOSE_POLL_INTERVAL`], to
    /// `SO_RCVTIMEO`. The socket is shared, so this runs before every receive.
    fn arm_read_timeout(&self) -> Result<(), TransportError> {
        let timeout = match self.read_deadline {
            Some(deadline) => socket_timeout(deadline)?.min(CLOSE_POLL_INTERVAL),
            None => CLOSE_POLL_INTERVAL,
        };
        self.inner
            .socket
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Io)
    }
}

/// Remaining time as a socket timeout. A zero timeval would block forever,
/// so an expired deadline is reported instead and tiny remainders are
/// rounded up to the timer resolution.
fn socket_timeout(deadline: Instant) -> Result<Duration, TransportError> {
    let timeout = remaining(deadline);
    if timeout.is_zero() {
        return Err(TransportError::TimedOut);
    }
    Ok(timeout.max(Duration::from_micros(1)))
}

/// Locates the payload of `frame` if it is a UDP datagram for `local_port`.
fn accept(frame: &[u8], local_port: u16) -> Option<Datagram> {
    let Some(datagram) = frame::parse(frame) else {
        tracing::trace!("Dropping malformed frame of {} bytes", frame.len());
        return None;
    };
    if datagram.protocol != IP_PROTO_UDP || datagram.dest_port != local_port {
        tracing::trace!(
            "Dropping frame from {} (protocol {}, port {})",
            datagram.source,
            datagram.protocol,
            datagram.dest_port
        );
        return None;
    }
    Some(datagram)
}

impl Connection for PacketConnection {
    fn read_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), TransportError> {
        let mut frame = vec![0u8; MAX_IP_HEADER_LEN + UDP_HEADER_LEN + buf.len()];
        loop {
            self.check_open()?;
            self.arm_read_timeout()?;

            let n = match (&self.inner.socket).read(&mut frame) {
                Ok(n) => n,
                Err(e) => match self.map_err(e) {
                    // End of a poll slice; the deadline is checked on re-arm.
                    TransportError::TimedOut => continue,
                    err => return Err(err),
                },
            };
            self.check_open()?;

            let Some(datagram) = accept(&frame[..n], self.local.port()) else {
                continue;
            };

            let len = datagram.len.min(buf.len());
            buf[..len].copy_from_slice(&frame[datagram.offset..datagram.offset + len]);
            return Ok((len, datagram.source));
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.check_open()?;
        let timeout = match self.write_deadline {
            Some(deadline) => Some(socket_timeout(deadline)?),
            None => None,
        };
        self.inner
            .socket
            .set_write_timeout(timeout)
            .map_err(TransportError::Io)?;

        let mut id = [0u8; 1];
        (self.inner.id_source)(&mut id).map_err(TransportError::Io)?;
        let frame = frame::encode(self.local, self.remote, id[0], buf)
            .ok_or(TransportError::PayloadTooLarge(buf.len()))?;

        let dest = link_addr(self.inner.ifindex, Some(BROADCAST_MAC));
        self.inner
            .socket
            .send_to(&frame, &dest)
            .map_err(|e| self.map_err(e))?;
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // The socket belongs to the transport.
        Ok(())
    }

    fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        self.check_open()?;
        self.read_deadline = Some(deadline);
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        self.check_open()?;
        self.write_deadline = Some(deadline);
        Ok(())
    }
}
