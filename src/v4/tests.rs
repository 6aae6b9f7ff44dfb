use super::handler::{Lease, Rejection, ReplyFilter};
use super::message::{self, *};
use bytes::Bytes;
use dhcproto::v4::{self, DhcpOption, MessageType, OptionCode};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

const MAC: [u8; 6] = [0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4];
const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const OFFERED: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);

fn reply(xid: u32, msg_type: MessageType) -> v4::Message {
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootReply)
        .set_xid(xid)
        .set_yiaddr(OFFERED)
        .set_siaddr(SERVER)
        .set_chaddr(&MAC);
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
    msg.opts_mut().insert(DhcpOption::ServerIdentifier(SERVER));
    msg
}

fn wire(msg: &v4::Message) -> Vec<u8> {
    message::encode(msg).unwrap()
}

fn server_addr() -> SocketAddrV4 {
    SocketAddrV4::new(SERVER, 67)
}

#[test]
fn test_build_dhcp_discover() {
    let mac_addr = Bytes::from_static(&MAC);
    let msg = build_dhcp_discover(&mac_addr, 0x12345678, true);

    assert_eq!(msg.xid(), 0x12345678);
    assert_eq!(msg.chaddr(), &mac_addr[..]);
    assert_eq!(msg.opcode(), v4::Opcode::BootRequest);
    assert!(msg.flags().broadcast());
    assert_eq!(message_type(&msg), Some(MessageType::Discover));
    assert_eq!(msg.ciaddr(), Ipv4Addr::UNSPECIFIED);

    match msg.opts().get(OptionCode::ClientIdentifier) {
        Some(DhcpOption::ClientIdentifier(id)) => {
            assert_eq!(id[0], 1);
            assert_eq!(&id[1..], &MAC[..]);
        }
        other => panic!("unexpected client identifier: {other:?}"),
    }
    assert!(msg.opts().get(OptionCode::ParameterRequestList).is_some());
}

#[test]
fn test_discover_without_broadcast_flag() {
    let msg = build_dhcp_discover(&MAC, 1, false);
    assert!(!msg.flags().broadcast());
}

#[test]
fn test_build_dhcp_request() {
    let mut offer = reply(0x87654321, MessageType::Offer);
    offer.set_ciaddr(Ipv4Addr::new(10, 0, 0, 9));

    let msg = build_dhcp_request(&MAC, &offer, true);

    assert_eq!(msg.xid(), 0x87654321);
    assert_eq!(message_type(&msg), Some(MessageType::Request));
    assert_eq!(requested_ip(&msg), Some(OFFERED));
    assert_eq!(server_identifier(&msg), Some(SERVER));
    assert_eq!(msg.ciaddr(), Ipv4Addr::new(10, 0, 0, 9));
    assert_eq!(msg.siaddr(), SERVER);
    assert!(msg.flags().broadcast());
}

#[test]
fn test_build_dhcp_request_without_server_identifier() {
    let mut offer = reply(7, MessageType::Offer);
    offer.opts_mut().remove(OptionCode::ServerIdentifier);

    let msg = build_dhcp_request(&MAC, &offer, true);
    assert_eq!(server_identifier(&msg), None);
    assert_eq!(requested_ip(&msg), Some(OFFERED));
}

#[test]
fn test_build_dhcp_renewal() {
    let msg = build_dhcp_renewal(&MAC, 42, OFFERED, Some(SERVER), false);

    assert_eq!(msg.xid(), 42);
    assert_eq!(message_type(&msg), Some(MessageType::Request));
    assert_eq!(msg.ciaddr(), OFFERED);
    assert_eq!(server_identifier(&msg), Some(SERVER));
    assert_eq!(requested_ip(&msg), None);
    assert!(!msg.flags().broadcast());
}

#[test]
fn test_build_dhcp_release() {
    let ack = reply(5, MessageType::Ack);
    let msg = build_dhcp_release(&MAC, 6, &ack);

    assert_eq!(msg.xid(), 6);
    assert_eq!(message_type(&msg), Some(MessageType::Release));
    assert_eq!(msg.ciaddr(), OFFERED);
    assert_eq!(server_identifier(&msg), Some(SERVER));
    assert!(msg.flags().broadcast());
}

#[test]
fn test_build_dhcp_decline() {
    let ack = reply(5, MessageType::Ack);
    let msg = build_dhcp_decline(&MAC, 8, &ack);

    assert_eq!(message_type(&msg), Some(MessageType::Decline));
    assert_eq!(requested_ip(&msg), Some(OFFERED));
    assert_eq!(server_identifier(&msg), Some(SERVER));
    assert_eq!(msg.ciaddr(), Ipv4Addr::UNSPECIFIED);
}

#[test]
fn test_encode_pads_short_messages() {
    let msg = build_dhcp_discover(&MAC, 0xdeadbeef, true);
    let packet = message::encode(&msg).unwrap();

    assert!(packet.len() >= MIN_PACKET_LEN);
    let decoded = message::decode(&packet).unwrap();
    assert_eq!(decoded.xid(), 0xdeadbeef);
    assert_eq!(message_type(&decoded), Some(MessageType::Discover));
}

#[test]
fn test_decode_rejects_garbage() {
    assert!(message::decode(&[0u8; 10]).is_err());
}

#[test]
fn test_client_options_apply_and_capture() {
    let mut opts = ClientOptions::new()
        .with(
            MessageType::Discover,
            OptionCode::Hostname,
            DhcpOption::Hostname("workstation".to_string()),
        )
        .capture_from(MessageType::Offer, OptionCode::AddressLeaseTime);

    let mut discover = build_dhcp_discover(&MAC, 1, true);
    opts.apply(MessageType::Discover, &mut discover);
    assert!(matches!(
        discover.opts().get(OptionCode::Hostname),
        Some(DhcpOption::Hostname(name)) if name == "workstation"
    ));

    // Entries without a value are never sent.
    let mut request = build_dhcp_request(&MAC, &reply(1, MessageType::Offer), true);
    opts.apply(MessageType::Offer, &mut request);
    assert!(request.opts().get(OptionCode::AddressLeaseTime).is_none());

    let mut offer = reply(1, MessageType::Offer);
    offer
        .opts_mut()
        .insert(DhcpOption::AddressLeaseTime(3600));
    opts.capture(MessageType::Offer, &offer);
    assert!(matches!(
        opts.get(MessageType::Offer, OptionCode::AddressLeaseTime),
        Some(DhcpOption::AddressLeaseTime(3600))
    ));
    assert!(opts.get(MessageType::Ack, OptionCode::AddressLeaseTime).is_none());
}

#[test]
fn test_capture_clears_missing_options() {
    let mut opts = ClientOptions::new().with(
        MessageType::Ack,
        OptionCode::DomainName,
        DhcpOption::DomainName("stale.example".to_string()),
    );
    opts.capture(MessageType::Ack, &reply(1, MessageType::Ack));
    assert!(opts.get(MessageType::Ack, OptionCode::DomainName).is_none());
    assert_eq!(opts.entries(MessageType::Ack).len(), 1);
}

#[test]
fn test_filter_accepts_matching_reply() {
    let accepted = [MessageType::Offer];
    let filter = ReplyFilter::new(9, &accepted, &[]);

    let (msg, msg_type) = filter
        .accept(&wire(&reply(9, MessageType::Offer)), server_addr())
        .unwrap();
    assert_eq!(msg.yiaddr(), OFFERED);
    assert_eq!(msg_type, MessageType::Offer);
}

#[test]
fn test_filter_rejects_foreign_xid() {
    let accepted = [MessageType::Offer];
    let filter = ReplyFilter::new(9, &accepted, &[]);

    assert_eq!(
        filter
            .accept(&wire(&reply(10, MessageType::Offer)), server_addr())
            .unwrap_err(),
        Rejection::XidMismatch {
            expected: 9,
            actual: 10
        }
    );
}

#[test]
fn test_filter_rejects_unexpected_type() {
    let accepted = [MessageType::Ack, MessageType::Nak];
    let filter = ReplyFilter::new(9, &accepted, &[]);

    assert_eq!(
        filter
            .accept(&wire(&reply(9, MessageType::Offer)), server_addr())
            .unwrap_err(),
        Rejection::UnexpectedType(Some(MessageType::Offer))
    );
    assert!(filter
        .accept(&wire(&reply(9, MessageType::Nak)), server_addr())
        .is_ok());
}

#[test]
fn test_filter_rejects_ignored_source() {
    let accepted = [MessageType::Offer];
    let rogue = Ipv4Addr::new(192, 168, 1, 66);
    let ignored = [rogue];
    let filter = ReplyFilter::new(9, &accepted, &ignored);

    let mut msg = reply(9, MessageType::Offer);
    msg.opts_mut().remove(OptionCode::ServerIdentifier);
    assert_eq!(
        filter
            .accept(&wire(&msg), SocketAddrV4::new(rogue, 67))
            .unwrap_err(),
        Rejection::IgnoredServer(rogue)
    );
}

#[test]
fn test_filter_rejects_ignored_server_identifier() {
    let accepted = [MessageType::Offer];
    let ignored = [SERVER];
    let filter = ReplyFilter::new(9, &accepted, &ignored);

    // Relayed: the source differs but the server identifier is ignored.
    let relay = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 67);
    assert_eq!(
        filter
            .accept(&wire(&reply(9, MessageType::Offer)), relay)
            .unwrap_err(),
        Rejection::IgnoredServer(SERVER)
    );
}

#[test]
fn test_filter_rejects_undecodable() {
    let accepted = [MessageType::Offer];
    let filter = ReplyFilter::new(9, &accepted, &[]);
    assert_eq!(
        filter.accept(&[1, 2, 3], server_addr()).unwrap_err(),
        Rejection::Undecodable
    );
}

#[test]
fn test_lease_from_ack() {
    let mut ack = reply(3, MessageType::Ack);
    ack.opts_mut()
        .insert(DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)));
    ack.opts_mut().insert(DhcpOption::Router(vec![SERVER]));
    ack.opts_mut()
        .insert(DhcpOption::DomainNameServer(vec![Ipv4Addr::new(8, 8, 8, 8)]));
    ack.opts_mut().insert(DhcpOption::AddressLeaseTime(86400));

    let lease = Lease::from_ack(&ack);
    assert_eq!(lease.offered_ip, OFFERED);
    assert_eq!(lease.subnet_mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
    assert_eq!(lease.routers, Some(vec![SERVER]));
    assert_eq!(lease.dns_servers, Some(vec![Ipv4Addr::new(8, 8, 8, 8)]));
    assert_eq!(lease.lease_duration, Some(Duration::from_secs(86400)));
    assert_eq!(lease.server_identifier, Some(SERVER));
}

#[test]
fn test_lease_without_options() {
    let mut ack = reply(3, MessageType::Ack);
    ack.opts_mut().remove(OptionCode::ServerIdentifier);

    let lease = Lease::from_ack(&ack);
    assert_eq!(lease.offered_ip, OFFERED);
    assert_eq!(lease.subnet_mask, None);
    assert_eq!(lease.lease_duration, None);
    assert_eq!(lease.server_identifier, None);
}
