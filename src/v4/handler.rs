//! Reply correlation and lease extraction.

use super::message::{decode, message_type, server_identifier};
use dhcproto::v4;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

/// Why a received datagram was not accepted as the awaited reply.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Rejection {
    Undecodable,
    IgnoredServer(Ipv4Addr),
    XidMismatch { expected: u32, actual: u32 },
    UnexpectedType(Option<v4::MessageType>),
}

/// Decides whether a datagram is the reply an exchange is waiting for.
#[derive(Debug, Clone)]
pub struct ReplyFilter<'a> {
    xid: u32,
    accepted: &'a [v4::MessageType],
    ignore_servers: &'a [Ipv4Addr],
}

impl<'a> ReplyFilter<'a> {
    pub fn new(xid: u32, accepted: &'a [v4::MessageType], ignore_servers: &'a [Ipv4Addr]) -> Self {
        Self {
            xid,
            accepted,
            ignore_servers,
        }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Decodes `data` received from `source` and returns the message with
    /// its type when it belongs to this exchange.
    pub fn accept(
        &self,
        data: &[u8],
        source: SocketAddrV4,
    ) -> Result<(v4::Message, v4::MessageType), Rejection> {
        let msg = decode(data).map_err(|_| Rejection::Undecodable)?;

        if self.ignore_servers.contains(source.ip()) {
            return Err(Rejection::IgnoredServer(*source.ip()));
        }
        if let Some(server_ip) = server_identifier(&msg) {
            if self.ignore_servers.contains(&server_ip) {
                return Err(Rejection::IgnoredServer(server_ip));
            }
        }

        let msg_type = match message_type(&msg) {
            Some(t) if self.accepted.contains(&t) => t,
            other => return Err(Rejection::UnexpectedType(other)),
        };

        if msg.xid() != self.xid {
            return Err(Rejection::XidMismatch {
                expected: self.xid,
                actual: msg.xid(),
            });
        }

        Ok((msg, msg_type))
    }
}

/// Lease information carried by an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub offered_ip: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub routers: Option<Vec<Ipv4Addr>>,
    pub dns_servers: Option<Vec<Ipv4Addr>>,
    pub lease_duration: Option<Duration>,
    pub server_identifier: Option<Ipv4Addr>,
}

impl Lease {
    pub fn from_ack(msg: &v4::Message) -> Self {
        let subnet_mask = match msg.opts().get(v4::OptionCode::SubnetMask) {
            Some(v4::DhcpOption::SubnetMask(mask)) => Some(*mask),
            _ => None,
        };

        let routers = match msg.opts().get(v4::OptionCode::Router) {
            Some(v4::DhcpOption::Router(routers)) => Some(routers.clone()),
            _ => None,
        };

        let dns_servers = match msg.opts().get(v4::OptionCode::DomainNameServer) {
            Some(v4::DhcpOption::DomainNameServer(dns)) => Some(dns.clone()),
            _ => None,
        };

        let lease_duration = match msg.opts().get(v4::OptionCode::AddressLeaseTime) {
            Some(v4::DhcpOption::AddressLeaseTime(secs)) => Some(Duration::from_secs(u64::from(*secs))),
            _ => None,
        };

        Self {
            offered_ip: msg.yiaddr(),
            subnet_mask,
            routers,
            dns_servers,
            lease_duration,
            server_identifier: server_identifier(msg),
        }
    }
}
