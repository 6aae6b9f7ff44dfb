//! DHCPv4 protocol implementation
//!
//! This module contains the DHCPv4-specific pieces used by the client:
//! - Message construction for every client message type
//! - Reply correlation and lease extraction
//! - Transaction id generation

pub mod handler;
pub mod message;
pub mod xid;

#[cfg(test)]
mod tests;

pub use handler::{Lease, Rejection, ReplyFilter};
pub use message::{
    build_dhcp_decline, build_dhcp_discover, build_dhcp_release, build_dhcp_renewal,
    build_dhcp_request, ClientOptions, OptionEntry, MAX_PACKET_LEN, MIN_PACKET_LEN,
};
pub use xid::{CryptoXid, SeededXid, XidGenerator};
