//! Socket-based transport, used once the host can speak UDP normally.

use super::{remaining, Connection, Transport, TransportError};
use crate::error::MultiError;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Instant,
};

pub const DEFAULT_LOCAL_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68);
pub const DEFAULT_REMOTE_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::BROADCAST, 67);

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    /// Live sockets keyed by the local address they were opened for.
    sockets: Mutex<HashMap<SocketAddrV4, Weak<UdpSocket>>>,
}

/// Hands out UDP connections, one socket per local address.
///
/// `dial` and `listen` on the same local address share a socket: the kernel
/// delivers a unicast reply to only one socket bound to an address, so the
/// writer must be the reader. Sockets are created with `SO_BROADCAST` and
/// `SO_REUSEADDR`.
#[derive(Default)]
pub struct UdpTransport {
    interface: Option<String>,
    shared: Arc<Shared>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts every socket to `interface` with `SO_BINDTODEVICE`.
    pub fn bound_to_device(interface: impl Into<String>) -> Self {
        Self {
            interface: Some(interface.into()),
            shared: Arc::default(),
        }
    }

    /// Returns the live socket for `local`, opening one if needed.
    fn open(&self, local: SocketAddrV4) -> Result<Arc<UdpSocket>, TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut sockets = self
            .shared
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = sockets.get(&local).and_then(Weak::upgrade) {
            return Ok(socket);
        }

        let socket = Arc::new(self.bind(local)?);
        sockets.retain(|_, weak| weak.strong_count() > 0);
        sockets.insert(local, Arc::downgrade(&socket));
        Ok(socket)
    }

    fn bind(&self, local: SocketAddrV4) -> Result<UdpSocket, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(TransportError::CreateSocket)?;
        socket
            .set_broadcast(true)
            .map_err(TransportError::SetBroadcast)?;
        socket
            .set_reuse_address(true)
            .map_err(TransportError::SetReuseAddress)?;
        if let Some(interface) = &self.interface {
            bind_to_device(&socket, interface)?;
        }
        socket
            .bind(&SocketAddr::V4(local).into())
            .map_err(|source| TransportError::BindSocket {
                addr: local.to_string(),
                source,
            })?;

        tracing::debug!("Opened UDP socket on {}", local);
        Ok(UdpSocket::from(socket))
    }
}

/// Sets `SO_BINDTODEVICE`. This is an unsafe raw syscall.
#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, interface: &str) -> Result<(), TransportError> {
    use std::os::fd::AsRawFd;

    // SAFETY: the descriptor is valid and the option value points at
    // `interface.len()` readable bytes.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(TransportError::BindToDevice {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Fallback for non-Linux systems where `SO_BINDTODEVICE` is not available.
#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &Socket, _interface: &str) -> Result<(), TransportError> {
    Err(TransportError::NotImplemented)
}

impl Transport for UdpTransport {
    fn dial(
        &self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let socket = self.open(local)?;
        Ok(Box::new(UdpConnection::new(socket, local, remote, self.shared.clone())))
    }

    fn listen(&self, local: SocketAddrV4) -> Result<Box<dyn Connection>, TransportError> {
        let socket = self.open(local)?;
        Ok(Box::new(UdpConnection::new(
            socket,
            local,
            DEFAULT_REMOTE_ADDR,
            self.shared.clone(),
        )))
    }

    fn close(&self) -> Result<(), MultiError> {
        self.shared.closed.store(true, Ordering::Release);
        let sockets = std::mem::take(
            &mut *self
                .shared
                .sockets
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut errors = MultiError::new();
        for socket in sockets.values().filter_map(Weak::upgrade) {
            // Unconnected UDP sockets report ENOTCONN but still wake readers.
            let result = match SockRef::from(&*socket).shutdown(std::net::Shutdown::Both) {
                Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
                other => other,
            };
            errors.push(result);
        }
        tracing::debug!("Closed UDP transport ({} failures)", errors.len());
        errors.into_result()
    }
}

/// A view of a UDP socket with a fixed remote address for writes.
pub struct UdpConnection {
    socket: Option<Arc<UdpSocket>>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    shared: Arc<Shared>,
    read_expired: bool,
    write_expired: bool,
}

impl UdpConnection {
    fn new(
        socket: Arc<UdpSocket>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        shared: Arc<Shared>,
    ) -> Self {
        let local = match socket.local_addr() {
            Ok(SocketAddr::V4(bound)) => bound,
            _ => local,
        };
        Self {
            socket: Some(socket),
            local,
            remote,
            shared,
            read_expired: false,
            write_expired: false,
        }
    }

    fn socket(&self) -> Result<&UdpSocket, TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.socket.as_deref().ok_or(TransportError::Closed)
    }

    fn map_err(&self, err: io::Error) -> TransportError {
        if self.shared.closed.load(Ordering::Acquire) {
            TransportError::Closed
        } else {
            TransportError::from_io(err)
        }
    }
}

impl Connection for UdpConnection {
    fn read_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), TransportError> {
        if self.read_expired {
            return Err(TransportError::TimedOut);
        }
        let socket = self.socket()?;
        match socket.recv_from(buf) {
            Ok(_) if self.shared.closed.load(Ordering::Acquire) => Err(TransportError::Closed),
            Ok((n, SocketAddr::V4(source))) => Ok((n, source)),
            Ok((_, SocketAddr::V6(source))) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected IPv6 sender {source}"),
            ))),
            Err(e) => Err(self.map_err(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.write_expired {
            return Err(TransportError::TimedOut);
        }
        let socket = self.socket()?;
        socket
            .send_to(buf, self.remote)
            .map_err(|e| self.map_err(e))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.socket = None;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        let timeout = remaining(deadline);
        self.read_expired = timeout.is_zero();
        if self.read_expired {
            return Ok(());
        }
        self.socket()?
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Io)
    }

    fn set_write_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        let timeout = remaining(deadline);
        self.write_expired = timeout.is_zero();
        if self.write_expired {
            return Ok(());
        }
        self.socket()?
            .set_write_timeout(Some(timeout))
            .map_err(TransportError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        v4::{message, MAX_PACKET_LEN},
        Client,
    };
    use dhcproto::v4;
    use std::time::Duration;

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    #[test]
    fn test_loopback_exchange() {
        let transport = UdpTransport::new();
        let mut listener = transport.listen(loopback()).unwrap();
        let server = listener.local_addr();
        assert_ne!(server.port(), 0);

        let mut dialer = transport.dial(loopback(), server).unwrap();
        assert_eq!(dialer.write(b"hello").unwrap(), 5);

        listener
            .set_read_deadline(Instant::now() + Duration::from_secs(2))
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, source) = listener.read_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(source, dialer.local_addr());
    }

    #[test]
    fn test_dial_shares_listening_socket() {
        let transport = UdpTransport::new();
        let listener = transport.listen(loopback()).unwrap();
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        let dialer = transport.dial(loopback(), peer).unwrap();

        assert_eq!(dialer.local_addr(), listener.local_addr());
        assert_eq!(dialer.remote_addr(), peer);
    }

    /// Answers `rounds` Discover/Request pairs straight away, without
    /// giving the client time to drop its sending connection.
    fn serve(server: UdpSocket, rounds: usize) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut buf = [0u8; MAX_PACKET_LEN];
            for _ in 0..rounds * 2 {
                let (n, peer) = server.recv_from(&mut buf).unwrap();
                let msg = message::decode(&buf[..n]).unwrap();
                let reply_type = match message::message_type(&msg) {
                    Some(v4::MessageType::Discover) => v4::MessageType::Offer,
                    Some(v4::MessageType::Request) => v4::MessageType::Ack,
                    other => panic!("unexpected client message {other:?}"),
                };

                let mut reply = v4::Message::default();
                reply
                    .set_opcode(v4::Opcode::BootReply)
                    .set_xid(msg.xid())
                    .set_yiaddr(Ipv4Addr::new(127, 0, 0, 50))
                    .set_chaddr(msg.chaddr());
                reply
                    .opts_mut()
                    .insert(v4::DhcpOption::MessageType(reply_type));
                reply
                    .opts_mut()
                    .insert(v4::DhcpOption::ServerIdentifier(Ipv4Addr::LOCALHOST));
                server
                    .send_to(&message::encode(&reply).unwrap(), peer)
                    .unwrap();
            }
        })
    }

    #[test]
    fn test_request_over_loopback() {
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let server_addr = match server.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => panic!("unexpected server address {addr}"),
        };

        let rounds = 10;
        let handle = serve(server, rounds);
        let client = Client::builder()
            .hardware_addr(vec![0xaa; 6])
            .timeout(Duration::from_secs(2))
            .local_addr(loopback())
            .broadcast_addr(server_addr)
            .transport(Arc::new(UdpTransport::new()))
            .build()
            .unwrap();

        for _ in 0..rounds {
            let ack = client.request().unwrap();
            assert!(ack.is_ack());
            assert_eq!(ack.packet().yiaddr(), Ipv4Addr::new(127, 0, 0, 50));
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_expired_deadline_fails_immediately() {
        let transport = UdpTransport::new();
        let mut listener = transport.listen(loopback()).unwrap();
        listener.set_read_deadline(Instant::now()).unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let err = listener.read_from(&mut buf).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_read_deadline_bounds_wait() {
        let transport = UdpTransport::new();
        let mut listener = transport.listen(loopback()).unwrap();
        listener
            .set_read_deadline(Instant::now() + Duration::from_millis(50))
            .unwrap();

        let mut buf = [0u8; 16];
        let err = listener.read_from(&mut buf).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_close_refuses_new_connections() {
        let transport = UdpTransport::new();
        let mut listener = transport.listen(loopback()).unwrap();
        transport.close().unwrap();

        assert!(matches!(transport.listen(loopback()), Err(TransportError::Closed)));
        let mut buf = [0u8; 16];
        assert!(matches!(listener.read_from(&mut buf), Err(TransportError::Closed)));
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let transport = Arc::new(UdpTransport::new());
        let mut listener = transport.listen(loopback()).unwrap();
        listener
            .set_read_deadline(Instant::now() + Duration::from_secs(10))
            .unwrap();

        let closer = {
            let transport = transport.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                transport.close()
            })
        };

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let err = listener.read_from(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(started.elapsed() < Duration::from_secs(5));
        closer.join().unwrap().unwrap();
    }
}
