use clap::Parser;
use dhcp4client::{
    network::{interface, udp::UdpTransport},
    Acknowledgement, Args, Client, ClientConfig, Transport,
};
use dhcproto::v4;
use std::{error::Error as StdError, net::SocketAddrV4, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Read the hardware (MAC) address from the system.
    let mac_addr = interface::hardware_addr(&args.interface)?;
    tracing::info!("Found MAC address {:02x?} on {}", &mac_addr[..], args.interface);

    let transport = open_transport(&args)?;
    let config = ClientConfig {
        hardware_addr: mac_addr,
        ..ClientConfig::from(&args)
    };
    let client = Arc::new(
        Client::builder()
            .config(config)
            .transport(transport.clone())
            .build()?,
    );

    let (renew, release) = (args.renew, args.release);
    let mut worker = {
        let client = client.clone();
        tokio::task::spawn_blocking(move || run(&client, renew, release))
    };

    tokio::select! {
        joined = &mut worker => {
            if let Err(e) = joined? {
                tracing::error!("DHCP exchange failed: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, closing transport");
            transport.close()?;
            if let Err(e) = worker.await? {
                tracing::info!("Exchange aborted: {}", e);
            }
        }
    }

    Ok(())
}

fn open_transport(args: &Args) -> Result<Arc<dyn Transport>, Box<dyn StdError>> {
    if args.raw {
        return packet_transport(&args.interface);
    }
    tracing::info!("Binding UDP sockets to interface '{}'", args.interface);
    Ok(Arc::new(UdpTransport::bound_to_device(args.interface.as_str())))
}

#[cfg(target_os = "linux")]
fn packet_transport(iface: &str) -> Result<Arc<dyn Transport>, Box<dyn StdError>> {
    let ifindex = interface::index(iface)?;
    tracing::info!("Opening packet socket on '{}' (index {})", iface, ifindex);
    Ok(Arc::new(dhcp4client::network::packet::PacketTransport::new(ifindex)?))
}

#[cfg(not(target_os = "linux"))]
fn packet_transport(_iface: &str) -> Result<Arc<dyn Transport>, Box<dyn StdError>> {
    Err(dhcp4client::TransportError::NotImplemented.into())
}

/// Obtains a lease, then optionally renews and releases it.
fn run(client: &Client, renew: bool, release: bool) -> Result<(), dhcp4client::Error> {
    let mut ack = match client.request()? {
        Acknowledgement::Ack(ack) => ack,
        Acknowledgement::Nak(_) => {
            tracing::warn!("Server refused the request");
            return Ok(());
        }
    };
    print_lease(&ack);

    if renew {
        let leased = SocketAddrV4::new(ack.yiaddr(), client.local_addr().port());
        client.set_local_addr(leased);
        match client.renew(&ack)? {
            Acknowledgement::Ack(renewed) => {
                print_lease(&renewed);
                ack = renewed;
            }
            Acknowledgement::Nak(_) => {
                tracing::warn!("Server refused the renewal");
                return Ok(());
            }
        }
    }

    if release {
        client.release(&ack)?;
    }
    Ok(())
}

fn print_lease(ack: &v4::Message) {
    let lease = dhcp4client::Lease::from_ack(ack);
    println!("Obtained lease: {}", lease.offered_ip);
    if let Some(mask) = lease.subnet_mask {
        println!("  subnet mask: {mask}");
    }
    if let Some(routers) = &lease.routers {
        println!("  routers: {routers:?}");
    }
    if let Some(dns) = &lease.dns_servers {
        println!("  dns servers: {dns:?}");
    }
    if let Some(duration) = lease.lease_duration {
        println!("  lease time: {}s", duration.as_secs());
    }
    if let Some(server) = lease.server_identifier {
        println!("  server: {server}");
    }
}
