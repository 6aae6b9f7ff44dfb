//! Transports used to move DHCP datagrams.
//!
//! A [`Transport`] hands out [`Connection`]s: `dial` for writes towards a
//! server (or the broadcast address) and `listen` for reads. Two backends
//! exist:
//!
//! - [`udp::UdpTransport`] - ordinary UDP sockets, one per call.
//! - [`packet::PacketTransport`] - a single `AF_PACKET` socket bound to an
//!   interface, framing IPv4/UDP by hand so it works before the host has an
//!   address (Linux only).

pub mod frame;
pub mod interface;
#[cfg(target_os = "linux")]
pub mod packet;
pub mod udp;

use crate::error::MultiError;
use std::{
    io,
    net::SocketAddrV4,
    time::Instant,
};
use thiserror::Error;

/// Defines all possible errors for transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to enable broadcast on socket")]
    SetBroadcast(#[source] io::Error),

    #[error("Failed to set SO_REUSEADDR on socket")]
    SetReuseAddress(#[source] io::Error),

    #[error("Failed to set SO_BINDTODEVICE on interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind socket to {addr}")]
    BindSocket {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The interface is not up yet. Sends that hit this are not the
    /// client's fault.
    #[error("Network is down")]
    NetworkDown(#[source] io::Error),

    #[error("Deadline exceeded")]
    TimedOut,

    #[error("Transport is closed")]
    Closed,

    #[error("I/O error")]
    Io(#[source] io::Error),

    #[error("Payload of {0} bytes does not fit in one IPv4 datagram")]
    PayloadTooLarge(usize),

    #[error("This operation is not implemented on the current platform")]
    NotImplemented,
}

impl TransportError {
    /// Classifies an error coming back from a send or receive syscall.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::TimedOut,
            _ => match err.raw_os_error() {
                Some(libc::ENETDOWN) | Some(libc::ENETUNREACH) => Self::NetworkDown(err),
                _ => Self::Io(err),
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn is_temporary(&self) -> bool {
        match self {
            Self::TimedOut | Self::NetworkDown(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    pub fn is_network_down(&self) -> bool {
        matches!(self, Self::NetworkDown(_))
    }
}

/// A datagram endpoint handed out by a [`Transport`].
pub trait Connection: Send {
    /// Reads one datagram payload into `buf`, returning its length and the
    /// sender. Never writes past `buf.len()`.
    fn read_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), TransportError>;

    /// Sends `buf` to the connection's remote address.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    fn local_addr(&self) -> SocketAddrV4;

    fn remote_addr(&self) -> SocketAddrV4;

    /// Bounds subsequent reads. A deadline already in the past makes the
    /// next read fail with [`TransportError::TimedOut`] immediately.
    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TransportError>;

    fn set_write_deadline(&mut self, deadline: Instant) -> Result<(), TransportError>;

    /// Sets both deadlines, keeping every failure.
    fn set_deadline(&mut self, deadline: Instant) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        errors.push(self.set_read_deadline(deadline));
        errors.push(self.set_write_deadline(deadline));
        errors.into_result()
    }
}

/// Factory for connections. Implementations must be shareable so that a
/// transport can be closed from another thread while an exchange blocks.
pub trait Transport: Send + Sync {
    /// Returns a connection ready for `write` towards `remote`.
    fn dial(
        &self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<Box<dyn Connection>, TransportError>;

    /// Returns a connection ready for `read_from` on `local`.
    fn listen(&self, local: SocketAddrV4) -> Result<Box<dyn Connection>, TransportError>;

    /// Releases pooled resources. Blocked reads and writes fail afterwards.
    fn close(&self) -> Result<(), MultiError> {
        Ok(())
    }
}

/// Remaining time until `deadline`, zero if it has passed.
pub(crate) fn remaining(deadline: Instant) -> std::time::Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_network_down() {
        let err = TransportError::from_io(io::Error::from_raw_os_error(libc::ENETDOWN));
        assert!(err.is_network_down());
        assert!(err.is_temporary());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_classifies_would_block_as_timeout() {
        let err = TransportError::from_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_timeout());
        assert!(err.is_temporary());
    }

    #[test]
    fn test_other_errors_are_plain_io() {
        let err = TransportError::from_io(io::Error::from_raw_os_error(libc::EBADF));
        assert!(matches!(err, TransportError::Io(_)));
        assert!(!err.is_temporary());
    }
}
