//! DHCPv4 message construction.
//!
//! Field layout is delegated to `dhcproto`; this module decides which
//! fields and options each client message carries.

use bytes::{BufMut as _, BytesMut};
use dhcproto::{
    v4::{self, OptionCode},
    Decodable as _, Encodable as _, Encoder,
};
use std::{collections::HashMap, error::Error as StdError, net::Ipv4Addr};

/// Encoded messages shorter than this are zero padded.
pub const MIN_PACKET_LEN: usize = 272;
/// Receive buffer size; a full Ethernet payload.
pub const MAX_PACKET_LEN: usize = 1500;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// An option slot keyed by code. `value` is sent when attached to an
/// outgoing type and overwritten with what a matching reply carried.
#[derive(Debug, Clone)]
pub struct OptionEntry {
    pub code: OptionCode,
    pub value: Option<v4::DhcpOption>,
}

/// Extra options per message type, both to send and to capture.
#[derive(Debug, Default, Clone)]
pub struct ClientOptions {
    entries: HashMap<v4::MessageType, Vec<OptionEntry>>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `option` (with code `code`) to outgoing messages of `msg_type`.
    pub fn with(mut self, msg_type: v4::MessageType, code: OptionCode, option: v4::DhcpOption) -> Self {
        self.entries.entry(msg_type).or_default().push(OptionEntry {
            code,
            value: Some(option),
        });
        self
    }

    /// Asks for option `code` to be captured from replies of `msg_type`.
    pub fn capture_from(mut self, msg_type: v4::MessageType, code: OptionCode) -> Self {
        self.entries
            .entry(msg_type)
            .or_default()
            .push(OptionEntry { code, value: None });
        self
    }

    pub fn entries(&self, msg_type: v4::MessageType) -> &[OptionEntry] {
        self.entries.get(&msg_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Value held for `code` under `msg_type`, if any.
    pub fn get(&self, msg_type: v4::MessageType, code: OptionCode) -> Option<&v4::DhcpOption> {
        self.entries(msg_type)
            .iter()
            .find(|entry| entry.code == code)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Inserts every present value registered for `msg_type` into `msg`.
    pub fn apply(&self, msg_type: v4::MessageType, msg: &mut v4::Message) {
        for option in self.entries(msg_type).iter().filter_map(|e| e.value.as_ref()) {
            msg.opts_mut().insert(option.clone());
        }
    }

    /// Overwrites the values registered for `msg_type` with those in `msg`.
    pub fn capture(&mut self, msg_type: v4::MessageType, msg: &v4::Message) {
        if let Some(entries) = self.entries.get_mut(&msg_type) {
            for entry in entries {
                entry.value = msg.opts().get(entry.code).cloned();
            }
        }
    }
}

pub fn message_type(msg: &v4::Message) -> Option<v4::MessageType> {
    match msg.opts().get(OptionCode::MessageType) {
        Some(v4::DhcpOption::MessageType(msg_type)) => Some(*msg_type),
        _ => None,
    }
}

pub fn server_identifier(msg: &v4::Message) -> Option<Ipv4Addr> {
    match msg.opts().get(OptionCode::ServerIdentifier) {
        Some(v4::DhcpOption::ServerIdentifier(ip)) => Some(*ip),
        _ => None,
    }
}

pub fn requested_ip(msg: &v4::Message) -> Option<Ipv4Addr> {
    match msg.opts().get(OptionCode::RequestedIpAddress) {
        Some(v4::DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => None,
    }
}

fn flags(broadcast: bool) -> v4::Flags {
    if broadcast {
        v4::Flags::default().set_broadcast()
    } else {
        v4::Flags::default()
    }
}

fn base(mac_addr: &[u8], xid: u32, msg_type: v4::MessageType, broadcast: bool) -> v4::Message {
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootRequest)
        .set_chaddr(mac_addr)
        .set_htype(v4::HType::Eth)
        .set_hops(0)
        .set_xid(xid)
        .set_secs(0)
        .set_flags(flags(broadcast));
    msg.opts_mut().insert(v4::DhcpOption::MessageType(msg_type));
    msg
}

/// Client Identifier (option 61): htype Ethernet followed by the MAC address.
fn client_identifier(mac_addr: &[u8]) -> v4::DhcpOption {
    let mut client_id = BytesMut::with_capacity(1 + mac_addr.len());
    client_id.put_u8(1);
    client_id.extend_from_slice(mac_addr);
    v4::DhcpOption::ClientIdentifier(client_id.freeze().to_vec())
}

fn parameter_request_list() -> v4::DhcpOption {
    v4::DhcpOption::ParameterRequestList(vec![
        OptionCode::SubnetMask,
        OptionCode::Router,
        OptionCode::DomainNameServer,
        OptionCode::DomainName,
        OptionCode::AddressLeaseTime,
    ])
}

/// Constructs a DHCP Discover message.
pub fn build_dhcp_discover(mac_addr: &[u8], xid: u32, broadcast: bool) -> v4::Message {
    let mut msg = base(mac_addr, xid, v4::MessageType::Discover, broadcast);
    msg.opts_mut().insert(client_identifier(mac_addr));
    msg.opts_mut().insert(parameter_request_list());
    msg
}

/// Constructs the DHCP Request answering `offer`. The transaction id is
/// carried over so the server can correlate it with its offer.
pub fn build_dhcp_request(mac_addr: &[u8], offer: &v4::Message, broadcast: bool) -> v4::Message {
    let mut msg = base(mac_addr, offer.xid(), v4::MessageType::Request, broadcast);
    msg.set_ciaddr(offer.ciaddr()).set_siaddr(offer.siaddr());

    msg.opts_mut()
        .insert(v4::DhcpOption::RequestedIpAddress(offer.yiaddr()));
    if let Some(server_ip) = server_identifier(offer) {
        msg.opts_mut()
            .insert(v4::DhcpOption::ServerIdentifier(server_ip));
    }
    msg.opts_mut().insert(client_identifier(mac_addr));
    msg.opts_mut().insert(parameter_request_list());
    msg
}

/// Constructs a renewal Request for the lease on `ciaddr`. Only renewals
/// populate ciaddr.
pub fn build_dhcp_renewal(
    mac_addr: &[u8],
    xid: u32,
    ciaddr: Ipv4Addr,
    server_ip: Option<Ipv4Addr>,
    broadcast: bool,
) -> v4::Message {
    let mut msg = base(mac_addr, xid, v4::MessageType::Request, broadcast);
    msg.set_ciaddr(ciaddr);
    if let Some(server_ip) = server_ip {
        msg.opts_mut()
            .insert(v4::DhcpOption::ServerIdentifier(server_ip));
    }
    msg.opts_mut().insert(client_identifier(mac_addr));
    msg.opts_mut().insert(parameter_request_list());
    msg
}

/// Constructs a Release giving back the lease in `ack`. The broadcast flag
/// is set as on every other client message; no reply is expected.
pub fn build_dhcp_release(mac_addr: &[u8], xid: u32, ack: &v4::Message) -> v4::Message {
    let mut msg = base(mac_addr, xid, v4::MessageType::Release, true);
    msg.set_ciaddr(ack.yiaddr());
    if let Some(server_ip) = server_identifier(ack) {
        msg.opts_mut()
            .insert(v4::DhcpOption::ServerIdentifier(server_ip));
    }
    msg.opts_mut().insert(client_identifier(mac_addr));
    msg
}

/// Constructs a Decline refusing the address offered in `ack`.
pub fn build_dhcp_decline(mac_addr: &[u8], xid: u32, ack: &v4::Message) -> v4::Message {
    let mut msg = base(mac_addr, xid, v4::MessageType::Decline, true);
    msg.opts_mut()
        .insert(v4::DhcpOption::RequestedIpAddress(ack.yiaddr()));
    if let Some(server_ip) = server_identifier(ack) {
        msg.opts_mut()
            .insert(v4::DhcpOption::ServerIdentifier(server_ip));
    }
    msg.opts_mut().insert(client_identifier(mac_addr));
    msg
}

/// Serializes `msg`, zero padded to [`MIN_PACKET_LEN`].
pub fn encode(msg: &v4::Message) -> Result<Vec<u8>, BoxError> {
    let mut buffer = Vec::with_capacity(MIN_PACKET_LEN);
    let mut encoder = Encoder::new(&mut buffer);
    msg.encode(&mut encoder)?;
    if buffer.len() < MIN_PACKET_LEN {
        buffer.resize(MIN_PACKET_LEN, 0);
    }
    Ok(buffer)
}

pub fn decode(data: &[u8]) -> Result<v4::Message, BoxError> {
    Ok(v4::Message::decode(&mut v4::Decoder::new(data))?)
}
