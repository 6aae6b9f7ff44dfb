//! # dhcp4client - A DHCPv4 Client Engine
//!
//! A library for obtaining, renewing, releasing and declining IPv4 leases.
//! It implements the DORA (Discover, Offer, Request, Acknowledge) exchange
//! on top of a pluggable transport:
//!
//! - An inet UDP transport, optionally bound to one interface
//! - A Linux link-layer packet transport that frames IPv4/UDP by hand,
//!   usable before the interface has an address
//!
//! Operations block the calling thread and are bounded by the client's
//! timeout. Closing the transport from another thread aborts them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dhcp4client::Client;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .hardware_addr(vec![0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4])
//!         .timeout(Duration::from_secs(5))
//!         .build()?;
//!     let ack = client.request()?;
//!     println!("Obtained lease: {:?}", ack.lease());
//!     client.close()?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod v4;

pub use client::{Acknowledgement, Client, ClientBuilder};
pub use config::{Args, ClientConfig};
pub use error::{Dhcp4Error, Error, MultiError};
pub use network::{Connection, Transport, TransportError};
pub use v4::Lease;
