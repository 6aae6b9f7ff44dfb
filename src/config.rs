use clap::Parser;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The network interface to bind to (e.g., 'eth0', 'lo')
    #[arg(short, long)]
    pub interface: String,

    /// Seconds to wait for each reply
    #[arg(short, long, default_value_t = 10)]
    pub timeout: u64,

    /// Ignore replies from this server (repeatable)
    #[arg(long = "ignore-server", value_name = "IP")]
    pub ignore_servers: Vec<Ipv4Addr>,

    /// Use a link-layer packet socket (needed before the interface has an address)
    #[arg(long)]
    pub raw: bool,

    /// Do not ask servers to broadcast their replies
    #[arg(long)]
    pub no_broadcast_flag: bool,

    /// Renew the lease right after obtaining it
    #[arg(long)]
    pub renew: bool,

    /// Release the lease before exiting
    #[arg(long)]
    pub release: bool,
}

/// Settings a [`Client`](crate::Client) is constructed from.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hardware_addr: bytes::Bytes,
    /// Overall time allowed for each awaited reply.
    pub timeout: Duration,
    pub ignore_servers: Vec<Ipv4Addr>,
    /// Set the BOOTP broadcast flag on Discover and Request.
    pub broadcast: bool,
    pub local_addr: SocketAddrV4,
    pub broadcast_addr: SocketAddrV4,
    /// Broadcast renewals instead of unicasting them to the lease's server.
    /// Only for servers that cannot be reached by unicast.
    pub renew_via_broadcast: bool,
}

impl ClientConfig {
    pub fn new(hardware_addr: bytes::Bytes) -> Self {
        Self {
            hardware_addr,
            timeout: Duration::from_secs(10),
            ignore_servers: Vec::new(),
            broadcast: true,
            local_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68),
            broadcast_addr: SocketAddrV4::new(Ipv4Addr::BROADCAST, 67),
            renew_via_broadcast: false,
        }
    }
}

impl From<&Args> for ClientConfig {
    fn from(args: &Args) -> Self {
        Self {
            timeout: Duration::from_secs(args.timeout),
            ignore_servers: args.ignore_servers.clone(),
            broadcast: !args.no_broadcast_flag,
            ..Self::new(bytes::Bytes::new())
        }
    }
}
