//! DHCP client implementation
//!
//! This module contains the protocol engine:
//! - Discover/Offer/Request/Acknowledge exchange
//! - Renewal, release and decline of a lease
//! - Reply correlation bounded by a shrinking deadline

use crate::{
    config::ClientConfig,
    error::{Dhcp4Error, Error, MultiError},
    network::{udp::UdpTransport, Connection, Transport, TransportError},
    v4::{
        handler::{Lease, ReplyFilter},
        message::{self, ClientOptions, MAX_PACKET_LEN},
        xid::{CryptoXid, XidGenerator},
    },
};
use bytes::Bytes;
use dhcproto::v4;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Outcome of an exchange that got an answer. A NAK is a protocol result,
/// not an error.
#[derive(Debug, Clone)]
pub enum Acknowledgement {
    Ack(v4::Message),
    Nak(v4::Message),
}

impl Acknowledgement {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack(_))
    }

    pub fn packet(&self) -> &v4::Message {
        match self {
            Self::Ack(msg) | Self::Nak(msg) => msg,
        }
    }

    pub fn into_packet(self) -> v4::Message {
        match self {
            Self::Ack(msg) | Self::Nak(msg) => msg,
        }
    }

    /// Lease details, for an ACK only.
    pub fn lease(&self) -> Option<Lease> {
        match self {
            Self::Ack(msg) => Some(Lease::from_ack(msg)),
            Self::Nak(_) => None,
        }
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    packet_ifindex: Option<i32>,
    xid_generator: Option<Arc<dyn XidGenerator>>,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            config: ClientConfig::new(Bytes::new()),
            transport: None,
            packet_ifindex: None,
            xid_generator: None,
        }
    }

    /// Replaces every setting with `config`.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hardware_addr(mut self, hardware_addr: impl Into<Bytes>) -> Self {
        self.config.hardware_addr = hardware_addr.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn ignore_servers(mut self, servers: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.config.ignore_servers = servers.into_iter().collect();
        self
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.config.broadcast = broadcast;
        self
    }

    pub fn local_addr(mut self, addr: SocketAddrV4) -> Self {
        self.config.local_addr = addr;
        self
    }

    pub fn broadcast_addr(mut self, addr: SocketAddrV4) -> Self {
        self.config.broadcast_addr = addr;
        self
    }

    pub fn renew_via_broadcast(mut self, enabled: bool) -> Self {
        self.config.renew_via_broadcast = enabled;
        self
    }

    /// Uses a caller-owned transport. [`Client::close`] leaves it open.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Opens an owned packet socket on `ifindex` at build time (Linux only).
    pub fn packet_socket(mut self, ifindex: i32) -> Self {
        self.packet_ifindex = Some(ifindex);
        self
    }

    pub fn xid_generator(mut self, generator: Arc<dyn XidGenerator>) -> Self {
        self.xid_generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let config = self.config;
        if config.hardware_addr.is_empty() || config.hardware_addr.len() > 16 {
            return Err(Error::Config(format!(
                "hardware address must be 1 to 16 bytes, got {}",
                config.hardware_addr.len()
            )));
        }
        if config.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }

        let (transport, owns_transport): (Arc<dyn Transport>, bool) = match self.transport {
            Some(transport) => (transport, false),
            None => (owned_transport(self.packet_ifindex)?, true),
        };

        Ok(Client {
            hardware_addr: config.hardware_addr,
            ignore_servers: config.ignore_servers,
            timeout: config.timeout,
            broadcast: config.broadcast,
            renew_via_broadcast: config.renew_via_broadcast,
            broadcast_addr: config.broadcast_addr,
            xid_generator: self.xid_generator.unwrap_or_else(|| Arc::new(CryptoXid)),
            transport,
            owns_transport,
            state: Mutex::new(State {
                local_addr: config.local_addr,
            }),
        })
    }
}

#[cfg(target_os = "linux")]
fn owned_transport(packet_ifindex: Option<i32>) -> Result<Arc<dyn Transport>, Error> {
    match packet_ifindex {
        Some(ifindex) => Ok(Arc::new(crate::network::packet::PacketTransport::new(ifindex)?)),
        None => Ok(Arc::new(UdpTransport::new())),
    }
}

#[cfg(not(target_os = "linux"))]
fn owned_transport(packet_ifindex: Option<i32>) -> Result<Arc<dyn Transport>, Error> {
    match packet_ifindex {
        Some(_) => Err(TransportError::NotImplemented.into()),
        None => Ok(Arc::new(UdpTransport::new())),
    }
}

struct State {
    local_addr: SocketAddrV4,
}

/// A DHCPv4 client session.
///
/// Every operation blocks until it completes or its deadline passes.
/// Operations on one client are serialized; the transport may be closed
/// from another thread to abort a blocked exchange.
pub struct Client {
    hardware_addr: Bytes,
    ignore_servers: Vec<Ipv4Addr>,
    timeout: Duration,
    broadcast: bool,
    renew_via_broadcast: bool,
    broadcast_addr: SocketAddrV4,
    xid_generator: Arc<dyn XidGenerator>,
    transport: Arc<dyn Transport>,
    owns_transport: bool,
    state: Mutex<State>,
}

const ACK_OR_NAK: [v4::MessageType; 2] = [v4::MessageType::Ack, v4::MessageType::Nak];

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn hardware_addr(&self) -> &[u8] {
        &self.hardware_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.lock().local_addr
    }

    /// Moves the client onto a new local endpoint, typically the leased
    /// address before a renewal. Waits for any exchange in progress.
    pub fn set_local_addr(&self, addr: SocketAddrV4) {
        self.lock().local_addr = addr;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_xid(&self) -> Result<u32, Dhcp4Error> {
        self.xid_generator
            .next_xid()
            .map_err(|e| Dhcp4Error::new(e).with_opcode(v4::Opcode::BootRequest))
    }

    /// Creates a Discover packet with a fresh transaction id.
    pub fn discover_packet(&self) -> Result<v4::Message, Dhcp4Error> {
        Ok(message::build_dhcp_discover(
            &self.hardware_addr,
            self.next_xid()?,
            self.broadcast,
        ))
    }

    /// Creates the Request answering `offer`.
    pub fn request_packet(&self, offer: &v4::Message) -> v4::Message {
        message::build_dhcp_request(&self.hardware_addr, offer, self.broadcast)
    }

    /// Creates a renewal Request for the lease acknowledged by `ack`.
    pub fn renewal_request_packet(&self, ack: &v4::Message) -> Result<v4::Message, Dhcp4Error> {
        Ok(message::build_dhcp_renewal(
            &self.hardware_addr,
            self.next_xid()?,
            ack.yiaddr(),
            message::server_identifier(ack),
            self.renew_via_broadcast,
        ))
    }

    pub fn release_packet(&self, ack: &v4::Message) -> Result<v4::Message, Dhcp4Error> {
        Ok(message::build_dhcp_release(
            &self.hardware_addr,
            self.next_xid()?,
            ack,
        ))
    }

    pub fn decline_packet(&self, ack: &v4::Message) -> Result<v4::Message, Dhcp4Error> {
        Ok(message::build_dhcp_decline(
            &self.hardware_addr,
            self.next_xid()?,
            ack,
        ))
    }

    /// Broadcasts a Discover and returns it.
    pub fn send_discover(&self) -> Result<v4::Message, Dhcp4Error> {
        self.send_discover_with_options(&ClientOptions::new())
    }

    pub fn send_discover_with_options(
        &self,
        opts: &ClientOptions,
    ) -> Result<v4::Message, Dhcp4Error> {
        let state = self.lock();
        self.send_discover_from(state.local_addr, opts)
    }

    fn send_discover_from(
        &self,
        local: SocketAddrV4,
        opts: &ClientOptions,
    ) -> Result<v4::Message, Dhcp4Error> {
        let mut discover = self.discover_packet()?;
        opts.apply(v4::MessageType::Discover, &mut discover);

        match self.transmit(local, self.broadcast_addr, &discover) {
            Err(TransmitError::Transport(e)) if e.is_network_down() => {
                tracing::warn!("Network down while broadcasting DHCP DISCOVER, assuming it was lost");
            }
            result => result.map_err(|e| e.into_dhcp(local, self.broadcast_addr))?,
        }
        tracing::info!("Sent DHCP DISCOVER, XID={:x}", discover.xid());
        Ok(discover)
    }

    /// Waits for an Offer answering the Discover with transaction id `xid`.
    /// Returns the offer and the address it came from.
    pub fn get_offer(&self, xid: u32) -> Result<(v4::Message, SocketAddrV4), Dhcp4Error> {
        self.get_offer_with_options(xid, &mut ClientOptions::new())
    }

    pub fn get_offer_with_options(
        &self,
        xid: u32,
        opts: &mut ClientOptions,
    ) -> Result<(v4::Message, SocketAddrV4), Dhcp4Error> {
        let state = self.lock();
        let local = state.local_addr;
        let mut conn = self.listen(local)?;
        let result = self.await_offer(conn.as_mut(), local, xid, Instant::now(), opts);
        close_quietly(conn.as_mut());
        result
    }

    /// Broadcasts the Request for `offer` and returns it.
    pub fn send_request(&self, offer: &v4::Message) -> Result<v4::Message, Dhcp4Error> {
        self.send_request_with_options(offer, &ClientOptions::new())
    }

    pub fn send_request_with_options(
        &self,
        offer: &v4::Message,
        opts: &ClientOptions,
    ) -> Result<v4::Message, Dhcp4Error> {
        let state = self.lock();
        self.send_request_from(state.local_addr, offer, opts)
    }

    fn send_request_from(
        &self,
        local: SocketAddrV4,
        offer: &v4::Message,
        opts: &ClientOptions,
    ) -> Result<v4::Message, Dhcp4Error> {
        let mut request = self.request_packet(offer);
        opts.apply(v4::MessageType::Request, &mut request);
        self.transmit(local, self.broadcast_addr, &request)
            .map_err(|e| e.into_dhcp(local, self.broadcast_addr))?;
        tracing::info!(
            "Sent DHCP REQUEST for {}, XID={:x}",
            offer.yiaddr(),
            request.xid()
        );
        Ok(request)
    }

    /// Waits for the ACK or NAK answering the Request with transaction id `xid`.
    pub fn get_acknowledgement(&self, xid: u32) -> Result<Acknowledgement, Dhcp4Error> {
        self.get_acknowledgement_with_options(xid, &mut ClientOptions::new())
    }

    pub fn get_acknowledgement_with_options(
        &self,
        xid: u32,
        opts: &mut ClientOptions,
    ) -> Result<Acknowledgement, Dhcp4Error> {
        let state = self.lock();
        let local = state.local_addr;
        let mut conn = self.listen(local)?;
        let result = self.await_acknowledgement(
            conn.as_mut(),
            local,
            self.broadcast_addr,
            xid,
            Instant::now(),
            opts,
        );
        close_quietly(conn.as_mut());
        result
    }

    /// Runs a full Discover/Offer/Request/Acknowledge exchange.
    pub fn request(&self) -> Result<Acknowledgement, Dhcp4Error> {
        self.request_with_options(&mut ClientOptions::new())
    }

    pub fn request_with_options(
        &self,
        opts: &mut ClientOptions,
    ) -> Result<Acknowledgement, Dhcp4Error> {
        let state = self.lock();
        let local = state.local_addr;

        // Listen before sending so no reply can arrive unheard.
        let mut conn = self.listen(local)?;
        let result = self.exchange(conn.as_mut(), local, opts);
        close_quietly(conn.as_mut());
        drop(state);
        result
    }

    fn exchange(
        &self,
        conn: &mut dyn Connection,
        local: SocketAddrV4,
        opts: &mut ClientOptions,
    ) -> Result<Acknowledgement, Dhcp4Error> {
        let discover = self.send_discover_from(local, opts)?;
        let (offer, _) = self.await_offer(conn, local, discover.xid(), Instant::now(), opts)?;

        let request = self.send_request_from(local, &offer, opts)?;
        self.await_acknowledgement(
            conn,
            local,
            self.broadcast_addr,
            request.xid(),
            Instant::now(),
            opts,
        )
    }

    /// Renews the lease acknowledged by `ack` with its server.
    ///
    /// The client's local address should already be the leased one.
    pub fn renew(&self, ack: &v4::Message) -> Result<Acknowledgement, Dhcp4Error> {
        self.renew_with_options(ack, &mut ClientOptions::new())
    }

    pub fn renew_with_options(
        &self,
        ack: &v4::Message,
        opts: &mut ClientOptions,
    ) -> Result<Acknowledgement, Dhcp4Error> {
        let state = self.lock();
        let local = state.local_addr;
        let dest = if self.renew_via_broadcast {
            self.broadcast_addr
        } else {
            self.server_addr(ack)
        };

        let mut renewal = self.renewal_request_packet(ack)?;
        opts.apply(v4::MessageType::Request, &mut renewal);

        let mut conn = self.listen(local)?;
        let result = self
            .transmit(local, dest, &renewal)
            .map_err(|e| e.into_dhcp(local, dest))
            .and_then(|()| {
                tracing::info!(
                    "Sent DHCP REQUEST renewing {} to {}, XID={:x}",
                    ack.yiaddr(),
                    dest,
                    renewal.xid()
                );
                self.await_acknowledgement(
                    conn.as_mut(),
                    local,
                    dest,
                    renewal.xid(),
                    Instant::now(),
                    opts,
                )
            });
        close_quietly(conn.as_mut());
        drop(state);
        result
    }

    /// Gives the lease in `ack` back to its server. No reply is awaited.
    pub fn release(&self, ack: &v4::Message) -> Result<(), Dhcp4Error> {
        let state = self.lock();
        let local = state.local_addr;
        let dest = self.server_addr(ack);
        let release = self.release_packet(ack)?;
        self.transmit(local, dest, &release)
            .map_err(|e| e.into_dhcp(local, dest))?;
        tracing::info!("Sent DHCP RELEASE for {} to {}", ack.yiaddr(), dest);
        Ok(())
    }

    /// Tells the server the address in `ack` is unusable. No reply is awaited.
    pub fn decline(&self, ack: &v4::Message) -> Result<(), Dhcp4Error> {
        let state = self.lock();
        let local = state.local_addr;
        let dest = self.broadcast_addr;
        let decline = self.decline_packet(ack)?;
        self.transmit(local, dest, &decline)
            .map_err(|e| e.into_dhcp(local, dest))?;
        tracing::info!("Sent DHCP DECLINE for {}", ack.yiaddr());
        Ok(())
    }

    /// Closes the transport if the client created it.
    pub fn close(&self) -> Result<(), MultiError> {
        if self.owns_transport {
            self.transport.close()
        } else {
            Ok(())
        }
    }

    /// The server that issued `ack`, falling back to broadcast when it did
    /// not identify itself.
    fn server_addr(&self, ack: &v4::Message) -> SocketAddrV4 {
        match message::server_identifier(ack) {
            Some(server_ip) => SocketAddrV4::new(server_ip, self.broadcast_addr.port()),
            None => {
                tracing::warn!("Acknowledgement has no server identifier, using broadcast");
                self.broadcast_addr
            }
        }
    }

    fn listen(&self, local: SocketAddrV4) -> Result<Box<dyn Connection>, Dhcp4Error> {
        self.transport.listen(local).map_err(|e| {
            Dhcp4Error::new(e)
                .with_opcode(v4::Opcode::BootReply)
                .with_addrs(local, self.broadcast_addr)
        })
    }

    /// Encodes `msg` and writes it on a one-shot connection.
    fn transmit(
        &self,
        local: SocketAddrV4,
        dest: SocketAddrV4,
        msg: &v4::Message,
    ) -> Result<(), TransmitError> {
        let packet = message::encode(msg).map_err(TransmitError::Encode)?;
        let mut conn = self.transport.dial(local, dest)?;
        let written = conn.write(&packet);
        close_quietly(conn.as_mut());
        written?;
        Ok(())
    }

    fn await_offer(
        &self,
        conn: &mut dyn Connection,
        local: SocketAddrV4,
        xid: u32,
        started: Instant,
        opts: &mut ClientOptions,
    ) -> Result<(v4::Message, SocketAddrV4), Dhcp4Error> {
        let accepted = [v4::MessageType::Offer];
        let filter = ReplyFilter::new(xid, &accepted, &self.ignore_servers);
        let (offer, msg_type, source) =
            self.await_reply(conn, &filter, local, self.broadcast_addr, started)?;
        opts.capture(msg_type, &offer);
        tracing::info!(
            "Received DHCP OFFER from {}, offered IP: {}",
            source,
            offer.yiaddr()
        );
        Ok((offer, source))
    }

    fn await_acknowledgement(
        &self,
        conn: &mut dyn Connection,
        local: SocketAddrV4,
        dest: SocketAddrV4,
        xid: u32,
        started: Instant,
        opts: &mut ClientOptions,
    ) -> Result<Acknowledgement, Dhcp4Error> {
        let filter = ReplyFilter::new(xid, &ACK_OR_NAK, &self.ignore_servers);
        let (reply, msg_type, source) = self.await_reply(conn, &filter, local, dest, started)?;
        opts.capture(msg_type, &reply);

        if msg_type == v4::MessageType::Ack {
            tracing::info!("Received DHCP ACK from {} for {}", source, reply.yiaddr());
            Ok(Acknowledgement::Ack(reply))
        } else {
            tracing::warn!("Received DHCP NAK from {}", source);
            Ok(Acknowledgement::Nak(reply))
        }
    }

    /// Reads until `filter` accepts a datagram or `timeout` has elapsed
    /// since `started`. Foreign datagrams only cost the time spent reading
    /// them.
    fn await_reply(
        &self,
        conn: &mut dyn Connection,
        filter: &ReplyFilter<'_>,
        local: SocketAddrV4,
        dest: SocketAddrV4,
        started: Instant,
    ) -> Result<(v4::Message, v4::MessageType, SocketAddrV4), Dhcp4Error> {
        let wrap = |e: TransportError| {
            Dhcp4Error::new(e)
                .with_opcode(v4::Opcode::BootReply)
                .with_addrs(local, dest)
        };
        let mut buf = vec![0u8; MAX_PACKET_LEN];

        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                tracing::debug!("Timeout waiting for reply to XID={:x}", filter.xid());
                return Err(Dhcp4Error::timed_out(local, dest).with_opcode(v4::Opcode::BootReply));
            }
            conn.set_read_deadline(Instant::now() + remaining)
                .map_err(wrap)?;

            let (n, source) = match conn.read_from(&mut buf) {
                Ok(read) => read,
                // Re-checked against the overall deadline above.
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(wrap(e)),
            };
            tracing::debug!("Received {} bytes from {}", n, source);

            match filter.accept(&buf[..n], source) {
                Ok((msg, msg_type)) => return Ok((msg, msg_type, source)),
                Err(reason) => {
                    tracing::debug!("Discarding packet from {}: {:?}", source, reason);
                }
            }
        }
    }
}

fn close_quietly(conn: &mut dyn Connection) {
    if let Err(e) = conn.close() {
        tracing::debug!("Failed to close connection: {}", e);
    }
}

/// Failure while putting a message on the wire.
enum TransmitError {
    Encode(Box<dyn std::error::Error + Send + Sync>),
    Transport(TransportError),
}

impl From<TransportError> for TransmitError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl TransmitError {
    fn into_dhcp(self, src: SocketAddrV4, dest: SocketAddrV4) -> Dhcp4Error {
        let err = match self {
            Self::Encode(e) => Dhcp4Error::new(e),
            Self::Transport(e) => Dhcp4Error::new(e),
        };
        err.with_opcode(v4::Opcode::BootRequest).with_addrs(src, dest)
    }
}
