use crate::network::TransportError;
use dhcproto::v4;
use std::{
    error::Error as StdError,
    fmt, io,
    net::SocketAddrV4,
    sync::OnceLock,
};
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DHCP exchange failed")]
    Dhcp(#[from] Dhcp4Error),

    #[error("Transport operation failed")]
    Transport(#[from] TransportError),

    #[error("Failed to close resources: {0}")]
    Close(#[from] MultiError),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("Failed to parse MAC address: {0}")]
    MacParse(String),

    #[error("Interface '{0}' not found or has no MAC address")]
    InterfaceInvalid(String),

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

/// An error raised during a DHCP exchange, with the endpoints involved.
///
/// `timeout()` and `temporary()` answer from the explicit flags when set,
/// otherwise from the wrapped error chain.
pub struct Dhcp4Error {
    err: BoxError,
    opcode: Option<v4::Opcode>,
    src: Option<SocketAddrV4>,
    dest: Option<SocketAddrV4>,
    is_timeout: Option<bool>,
    is_temporary: Option<bool>,
    timeout_cache: OnceLock<bool>,
    temporary_cache: OnceLock<bool>,
}

impl Dhcp4Error {
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self {
            err: err.into(),
            opcode: None,
            src: None,
            dest: None,
            is_timeout: None,
            is_temporary: None,
            timeout_cache: OnceLock::new(),
            temporary_cache: OnceLock::new(),
        }
    }

    /// The overall deadline ran out before a matching reply arrived.
    pub fn timed_out(src: SocketAddrV4, dest: SocketAddrV4) -> Self {
        Self::new("timed out")
            .with_addrs(src, dest)
            .with_timeout(true)
            .with_temporary(true)
    }

    pub fn with_opcode(mut self, opcode: v4::Opcode) -> Self {
        self.opcode = Some(opcode);
        self
    }

    pub fn with_addrs(mut self, src: SocketAddrV4, dest: SocketAddrV4) -> Self {
        self.src = Some(src);
        self.dest = Some(dest);
        self
    }

    pub fn with_timeout(mut self, timeout: bool) -> Self {
        self.is_timeout = Some(timeout);
        self
    }

    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.is_temporary = Some(temporary);
        self
    }

    pub fn opcode(&self) -> Option<v4::Opcode> {
        self.opcode
    }

    pub fn src(&self) -> Option<SocketAddrV4> {
        self.src
    }

    pub fn dest(&self) -> Option<SocketAddrV4> {
        self.dest
    }

    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.err
    }

    pub fn timeout(&self) -> bool {
        if let Some(explicit) = self.is_timeout {
            return explicit;
        }
        *self
            .timeout_cache
            .get_or_init(|| chain_has(&*self.err, signals_timeout))
    }

    pub fn temporary(&self) -> bool {
        if let Some(explicit) = self.is_temporary {
            return explicit;
        }
        *self
            .temporary_cache
            .get_or_init(|| chain_has(&*self.err, signals_temporary))
    }
}

fn chain_has(
    err: &(dyn StdError + 'static),
    check: fn(&(dyn StdError + 'static)) -> bool,
) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if check(e) {
            return true;
        }
        current = e.source();
    }
    false
}

fn signals_timeout(err: &(dyn StdError + 'static)) -> bool {
    if let Some(e) = err.downcast_ref::<io::Error>() {
        return matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock);
    }
    if let Some(e) = err.downcast_ref::<TransportError>() {
        return e.is_timeout();
    }
    if let Some(e) = err.downcast_ref::<Dhcp4Error>() {
        return e.timeout();
    }
    false
}

fn signals_temporary(err: &(dyn StdError + 'static)) -> bool {
    if let Some(e) = err.downcast_ref::<io::Error>() {
        return matches!(
            e.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        );
    }
    if let Some(e) = err.downcast_ref::<TransportError>() {
        return e.is_temporary();
    }
    if let Some(e) = err.downcast_ref::<Dhcp4Error>() {
        return e.temporary();
    }
    false
}

impl From<TransportError> for Dhcp4Error {
    fn from(err: TransportError) -> Self {
        Self::new(err)
    }
}

impl fmt::Debug for Dhcp4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dhcp4Error")
            .field("err", &self.err)
            .field("opcode", &self.opcode)
            .field("src", &self.src)
            .field("dest", &self.dest)
            .field("is_timeout", &self.is_timeout)
            .field("is_temporary", &self.is_temporary)
            .finish()
    }
}

impl fmt::Display for Dhcp4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dhcp4")?;
        if let Some(opcode) = self.opcode {
            write!(f, " {opcode:?}")?;
        }
        match (self.src, self.dest) {
            (Some(src), Some(dest)) => write!(f, " {src}->{dest}")?,
            (Some(src), None) => write!(f, " {src}")?,
            (None, Some(dest)) => write!(f, " ->{dest}")?,
            (None, None) => {}
        }
        write!(f, ": {}", self.err)
    }
}

impl StdError for Dhcp4Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.err)
    }
}

/// Several independent failures reported as one.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<BoxError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the error of a failed result; successes are dropped.
    pub fn push<E: Into<BoxError>>(&mut self, result: Result<(), E>) {
        if let Err(e) = result {
            self.errors.push(e.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> impl Iterator<Item = &(dyn StdError + Send + Sync + 'static)> {
        self.errors.iter().map(|e| &**e)
    }

    /// `Ok(())` only when nothing failed.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(" & ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl StdError for MultiError {}
